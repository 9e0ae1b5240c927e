//! Catalog feed ingestion.
//!
//! Consumes raw feed payloads, splits them into items, upserts the items
//! and, when `report_queue` is set, forwards one `feed:sku` line per item
//! followed by the end-of-batch sentinel for the report worker.

use super::queue_consumer;
use crate::broker::Channel;
use crate::config::Properties;
use crate::consumer::{AckMode, END_OF_BATCH, MessageHandler, QueueConsumer};
use crate::context::AppContext;
use crate::datastore::CatalogItem;
use crate::error::{Error, Result};
use crate::model::{JobMessage, Producer};
use crate::worker::{Job, JobContext, SettingsCell};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns a raw feed payload into item records.
pub trait CatalogSplitter: Send + Sync {
    fn split(&self, payload: &[u8]) -> Result<Vec<CatalogItem>>;
}

/// One JSON object per line; the key is read from `key_field`.
#[derive(Debug, Clone)]
pub struct JsonLinesSplitter {
    key_field: String,
}

impl Default for JsonLinesSplitter {
    fn default() -> Self {
        Self::new("sku")
    }
}

impl JsonLinesSplitter {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
        }
    }
}

impl CatalogSplitter for JsonLinesSplitter {
    fn split(&self, payload: &[u8]) -> Result<Vec<CatalogItem>> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::Decode(format!("catalog payload is not UTF-8: {e}")))?;
        let mut items = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let data: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| Error::Decode(format!("line {}: {e}", n + 1)))?;
            let sku = match data.get(&self.key_field) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
                Some(serde_json::Value::Number(num)) => num.to_string(),
                _ => {
                    return Err(Error::Decode(format!(
                        "line {}: missing '{}'",
                        n + 1,
                        self.key_field
                    )));
                }
            };
            items.push(CatalogItem { sku, data });
        }
        Ok(items)
    }
}

#[derive(Debug)]
struct CatalogSettings {
    consumer: QueueConsumer,
    feed: String,
    report_queue: Option<String>,
}

pub struct CatalogIngestJob {
    settings: SettingsCell<CatalogSettings>,
    splitter: Arc<dyn CatalogSplitter>,
}

impl Default for CatalogIngestJob {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogIngestJob {
    pub const IMPLEMENTATION: &'static str = "catalog-ingest";

    pub fn new() -> Self {
        Self::with_splitter(Arc::new(JsonLinesSplitter::default()))
    }

    pub fn with_splitter(splitter: Arc<dyn CatalogSplitter>) -> Self {
        Self {
            settings: SettingsCell::new(),
            splitter,
        }
    }

    /// Split, store and optionally forward one payload. Returns the number of
    /// items stored.
    async fn ingest(
        &self,
        app: &AppContext,
        settings: &CatalogSettings,
        payload: &[u8],
        channel: &dyn Channel,
    ) -> Result<u64> {
        let items = self.splitter.split(payload)?;
        let stored = app
            .datastore
            .store_catalog_items(&settings.feed, &items)
            .await?;
        debug!(feed = %settings.feed, items = items.len(), stored, "catalog payload stored");

        if let Some(queue) = &settings.report_queue {
            for item in &items {
                let line = format!("{}:{}", settings.feed, item.sku);
                channel.publish("", queue, line.as_bytes()).await?;
            }
            channel.publish("", queue, END_OF_BATCH.as_bytes()).await?;
        }
        Ok(stored)
    }
}

#[async_trait]
impl Job for CatalogIngestJob {
    fn producer(&self) -> Producer {
        Producer::CatalogFeed
    }

    async fn configure(&self, properties: &Properties) -> Result<()> {
        let consumer = queue_consumer(properties, AckMode::BeforeProcessing)?;
        let feed = properties
            .get("feed")
            .map(str::to_string)
            .unwrap_or_else(|| consumer.queue().to_string());
        let report_queue = properties
            .get("report_queue")
            .filter(|q| !q.trim().is_empty())
            .map(str::to_string);
        self.settings.store(CatalogSettings {
            consumer,
            feed,
            report_queue,
        });
        Ok(())
    }

    async fn do_processing(&self, cx: &JobContext) -> Result<()> {
        let settings = self.settings.load()?;
        let handler = FeedHandler {
            job: self,
            settings: &settings,
            app: cx.app(),
        };
        let settled = settings.consumer.run(cx, &handler).await?;
        info!(worker = %cx.worker_name(), settled, "catalog consumer finished");
        Ok(())
    }

    async fn process_data(&self, cx: &JobContext, data: &[u8]) -> Result<i64> {
        let settings = self.settings.load()?;
        let channel = cx.app().broker.connect().await?;
        let result = self.ingest(cx.app(), &settings, data, channel.as_ref()).await;
        channel.close().await?;
        Ok(result? as i64)
    }
}

struct FeedHandler<'a> {
    job: &'a CatalogIngestJob,
    settings: &'a CatalogSettings,
    app: &'a AppContext,
}

#[async_trait]
impl MessageHandler for FeedHandler<'_> {
    async fn handle(&self, message: &JobMessage, channel: &dyn Channel) -> Result<()> {
        self.job
            .ingest(self.app, self.settings, &message.payload, channel)
            .await
            .map(|_| ())
    }
}
