//! Operator notifications.
//!
//! A [`Notifier`] delivers alerts to people. Callers on worker paths use
//! [`notify_soft`], which logs a failed send instead of propagating it: an
//! alert channel outage must never take a worker down.

use crate::broker::{Broker, Channel};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{error, warn};

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()>;
}

/// Send and log on failure. Never fails.
pub async fn notify_soft(notifier: &dyn Notifier, recipients: &[String], subject: &str, body: &str) {
    if let Err(e) = notifier.send(recipients, subject, body).await {
        error!(subject, error = %e, "operator notification failed");
    }
}

/// A notification as sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// Writes alerts to the log. The fallback when no alert channel is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        warn!(recipients = %recipients.join(","), subject, body, "operator alert");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Publishes alerts as JSON onto a broker queue, for a mail relay to pick up.
pub struct QueueNotifier {
    broker: Arc<dyn Broker>,
    queue: String,
    channel: OnceCell<Arc<dyn Channel>>,
}

impl QueueNotifier {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            channel: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Notifier for QueueNotifier {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        if recipients.is_empty() {
            warn!(subject, "alert has no recipients, logging only");
            return LogNotifier.send(recipients, subject, body).await;
        }
        let channel = self
            .channel
            .get_or_try_init(|| self.broker.connect())
            .await
            .map_err(|e| Error::Notify(format!("alert channel: {e}")))?;
        let notification = Notification {
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&notification)?;
        channel
            .publish("", &self.queue, &payload)
            .await
            .map_err(|e| Error::Notify(format!("publish to {}: {e}", self.queue)))
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Keeps every notification in memory. For tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Notifications whose subject contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.subject.contains(needle))
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Notification {
                recipients: recipients.to_vec(),
                subject: subject.to_string(),
                body: body.to_string(),
                sent_at: Utc::now(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn send(&self, _: &[String], _: &str, _: &str) -> Result<()> {
            Err(Error::Notify("smtp down".to_string()))
        }
    }

    #[tokio::test]
    async fn notify_soft_swallows_failures() {
        notify_soft(&Failing, &["ops@example.com".to_string()], "s", "b").await;
    }

    #[tokio::test]
    async fn queue_notifier_publishes_json() {
        let broker = MemoryBroker::new();
        let notifier = QueueNotifier::new(Arc::new(broker.clone()), "alerts");
        notifier
            .send(&["ops@example.com".to_string()], "feed down", "details")
            .await
            .unwrap();
        let queued = broker.peek("alerts");
        assert_eq!(queued.len(), 1);
        let parsed: Notification = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(parsed.subject, "feed down");
        assert_eq!(parsed.recipients, vec!["ops@example.com"]);
    }
}
