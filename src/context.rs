//! Process-wide collaborators, built once at startup and passed by reference.

use crate::broker::{Broker, MemoryBroker};
use crate::datastore::{Datastore, MemoryDatastore};
use crate::notify::{MemoryNotifier, Notifier, notify_soft};
use std::sync::Arc;

/// Shared handles to the datastore, broker and notifier.
#[derive(Clone)]
pub struct AppContext {
    pub datastore: Arc<dyn Datastore>,
    pub broker: Arc<dyn Broker>,
    pub notifier: Arc<dyn Notifier>,
    /// Who gets operator alerts.
    pub alert_recipients: Arc<Vec<String>>,
}

impl AppContext {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        alert_recipients: Vec<String>,
    ) -> Self {
        Self {
            datastore,
            broker,
            notifier,
            alert_recipients: Arc::new(alert_recipients),
        }
    }

    /// Alert operators. Failures are logged, never returned.
    pub async fn alert(&self, subject: &str, body: &str) {
        notify_soft(self.notifier.as_ref(), &self.alert_recipients, subject, body).await;
    }
}

/// An [`AppContext`] wired to in-memory collaborators, with typed handles
/// kept for inspection.
pub struct MemoryContext {
    pub app: AppContext,
    pub datastore: Arc<MemoryDatastore>,
    pub broker: MemoryBroker,
    pub notifier: Arc<MemoryNotifier>,
}

impl MemoryContext {
    pub fn new() -> Self {
        let datastore = Arc::new(MemoryDatastore::new());
        let broker = MemoryBroker::new();
        let notifier = Arc::new(MemoryNotifier::new());
        let app = AppContext::new(
            datastore.clone(),
            Arc::new(broker.clone()),
            notifier.clone(),
            vec!["ops@example.com".to_string()],
        );
        Self {
            app,
            datastore,
            broker,
            notifier,
        }
    }
}

impl Default for MemoryContext {
    fn default() -> Self {
        Self::new()
    }
}
