//! Report dispatch for sentinel-terminated batches.
//!
//! Each cycle drains the report queue with a [`PullConsumer`]. Item lines
//! accumulate until the end-of-batch sentinel arrives; the report is then
//! mailed through the notifier and recorded.

use crate::config::Properties;
use crate::consumer::{BatchHandler, PullConsumer};
use crate::datastore::ReportRecord;
use crate::error::Result;
use crate::model::{JobMessage, Producer};
use crate::worker::{Job, JobContext, SettingsCell};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

struct ReportSettings {
    consumer: PullConsumer,
    /// Falls back to the operator alert list when empty.
    recipients: Vec<String>,
    subject: String,
}

pub struct ReportDispatchJob {
    settings: SettingsCell<ReportSettings>,
    batch: Mutex<Vec<String>>,
}

impl Default for ReportDispatchJob {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportDispatchJob {
    pub const IMPLEMENTATION: &'static str = "report-dispatch";

    pub fn new() -> Self {
        Self {
            settings: SettingsCell::new(),
            batch: Mutex::new(Vec::new()),
        }
    }

    /// Lines collected for the batch in progress.
    pub fn pending(&self) -> usize {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn push_item(&self, line: &str) {
        self.batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }

    async fn dispatch(&self, cx: &JobContext, settings: &ReportSettings) -> Result<u64> {
        let lines = self
            .batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let recipients = if settings.recipients.is_empty() {
            cx.app().alert_recipients.as_ref().clone()
        } else {
            settings.recipients.clone()
        };

        let mut body = format!("{} item(s) in this batch.\n\n", lines.len());
        for line in &lines {
            body.push_str(line);
            body.push('\n');
        }
        cx.app()
            .notifier
            .send(&recipients, &settings.subject, &body)
            .await?;

        let items = lines.len() as u64;
        cx.app()
            .datastore
            .record_report(&ReportRecord {
                id: Uuid::new_v4(),
                worker: cx.worker_name().to_string(),
                items,
                recipients,
                dispatched_at: Utc::now(),
            })
            .await?;

        // Only the lines that went out; items pushed meanwhile stay.
        {
            let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
            let sent = lines.len().min(batch.len());
            batch.drain(..sent);
        }
        info!(worker = %cx.worker_name(), items, "report dispatched");
        Ok(items)
    }
}

#[async_trait]
impl Job for ReportDispatchJob {
    fn producer(&self) -> Producer {
        Producer::ReportDispatch
    }

    async fn configure(&self, properties: &Properties) -> Result<()> {
        let mut consumer = PullConsumer::new(properties.require("queue")?);
        if let Some(sentinel) = properties.get("sentinel") {
            consumer = consumer.with_sentinel(sentinel);
        }
        self.settings.store(ReportSettings {
            consumer,
            recipients: properties.list("recipients"),
            subject: properties
                .get("subject")
                .unwrap_or("Batch report")
                .to_string(),
        });
        Ok(())
    }

    async fn do_processing(&self, cx: &JobContext) -> Result<()> {
        let settings = self.settings.load()?;
        let channel = cx.app().broker.connect().await?;
        let handler = ReportBatch {
            job: self,
            cx,
            settings: &settings,
        };
        cx.set_action(format!("draining {}", settings.consumer.queue()));
        let result = settings
            .consumer
            .drain(channel.as_ref(), &handler, &|| cx.is_running())
            .await;
        if let Err(e) = channel.close().await {
            warn!(worker = %cx.worker_name(), error = %e, "failed to close report channel");
        }
        let report = result?;
        if report.items > 0 || report.batch_ended {
            info!(
                worker = %cx.worker_name(),
                items = report.items,
                batch_ended = report.batch_ended,
                "report queue drained"
            );
        }
        Ok(())
    }

    /// Feed lines directly. A sentinel line dispatches the batch. Returns the
    /// number of item lines taken.
    async fn process_data(&self, cx: &JobContext, data: &[u8]) -> Result<i64> {
        let settings = self.settings.load()?;
        let text = String::from_utf8_lossy(data);
        let mut taken = 0;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line == settings.consumer.sentinel() {
                self.dispatch(cx, &settings).await?;
            } else {
                self.push_item(line);
                taken += 1;
            }
        }
        Ok(taken)
    }
}

struct ReportBatch<'a> {
    job: &'a ReportDispatchJob,
    cx: &'a JobContext,
    settings: &'a ReportSettings,
}

#[async_trait]
impl BatchHandler for ReportBatch<'_> {
    async fn on_item(&self, message: &JobMessage) -> Result<()> {
        self.job.push_item(message.text().trim());
        Ok(())
    }

    async fn on_batch_end(&self) -> Result<()> {
        self.job.dispatch(self.cx, self.settings).await.map(|_| ())
    }
}
