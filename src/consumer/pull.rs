//! Pull consumer for sentinel-terminated batches.
//!
//! Polls the queue depth and `get`s one message at a time while the worker
//! is running. Ordinary messages go to [`BatchHandler::on_item`]; the sentinel
//! payload triggers [`BatchHandler::on_batch_end`] once and ends the drain.

use crate::broker::Channel;
use crate::error::Result;
use crate::model::JobMessage;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Default sentinel payload marking the end of a batch.
pub const END_OF_BATCH: &str = "end-of-batch";

#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn on_item(&self, message: &JobMessage) -> Result<()>;

    /// Called once when the sentinel arrives.
    async fn on_batch_end(&self) -> Result<()>;
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Ordinary messages processed and acked.
    pub items: u64,
    /// Whether the sentinel was seen and the batch path ran.
    pub batch_ended: bool,
}

#[derive(Debug, Clone)]
pub struct PullConsumer {
    queue: String,
    sentinel: String,
}

impl PullConsumer {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            sentinel: END_OF_BATCH.to_string(),
        }
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    fn is_sentinel(&self, message: &JobMessage) -> bool {
        message.text().trim() == self.sentinel
    }

    /// Drain the queue until it is empty, the worker stops, or the sentinel
    /// is processed.
    ///
    /// Every message taken is acked on success. A handler failure nacks the
    /// message with requeue and returns the error, so the next pass sees it
    /// again.
    pub async fn drain(
        &self,
        channel: &dyn Channel,
        handler: &dyn BatchHandler,
        is_running: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        while is_running() && channel.message_count(&self.queue).await? > 0 {
            let Some(message) = channel.get(&self.queue, false).await? else {
                debug!(queue = %self.queue, "queue emptied between count and get");
                break;
            };

            if self.is_sentinel(&message) {
                if let Err(e) = handler.on_batch_end().await {
                    warn!(queue = %self.queue, error = %e, "batch completion failed, sentinel requeued");
                    channel.nack(message.tag, true).await?;
                    return Err(e);
                }
                channel.ack(message.tag).await?;
                report.batch_ended = true;
                info!(queue = %self.queue, items = report.items, "batch complete");
                break;
            }

            if let Err(e) = handler.on_item(&message).await {
                warn!(queue = %self.queue, tag = %message.tag, error = %e, "item failed, requeued");
                channel.nack(message.tag, true).await?;
                return Err(e);
            }
            channel.ack(message.tag).await?;
            report.items += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerCall, MemoryBroker};
    use crate::error::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        items: Mutex<Vec<String>>,
        ends: Mutex<u32>,
        fail_end: bool,
    }

    #[async_trait]
    impl BatchHandler for Recording {
        async fn on_item(&self, message: &JobMessage) -> Result<()> {
            self.items.lock().unwrap().push(message.text().into_owned());
            Ok(())
        }

        async fn on_batch_end(&self) -> Result<()> {
            if self.fail_end {
                return Err(Error::Notify("relay down".to_string()));
            }
            *self.ends.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn sentinel_ends_the_drain_without_further_gets() {
        let broker = MemoryBroker::new();
        for payload in ["item-1", "item-2", END_OF_BATCH, "item-3"] {
            broker.push("batch", payload);
        }
        let channel = broker.connect().await.unwrap();
        let handler = Recording::default();

        let report = PullConsumer::new("batch")
            .drain(channel.as_ref(), &handler, &|| true)
            .await
            .unwrap();

        assert_eq!(report, DrainReport { items: 2, batch_ended: true });
        assert_eq!(*handler.items.lock().unwrap(), vec!["item-1", "item-2"]);
        assert_eq!(*handler.ends.lock().unwrap(), 1);
        assert_eq!(broker.gets("batch"), 3);
        assert_eq!(broker.peek("batch"), vec!["item-3"]);
    }

    #[tokio::test]
    async fn failed_batch_end_requeues_the_sentinel() {
        let broker = MemoryBroker::new();
        broker.push("batch", END_OF_BATCH);
        let channel = broker.connect().await.unwrap();
        let handler = Recording {
            fail_end: true,
            ..Default::default()
        };

        let result = PullConsumer::new("batch")
            .drain(channel.as_ref(), &handler, &|| true)
            .await;

        assert!(result.is_err());
        assert!(broker.calls().iter().any(|c| matches!(c, BrokerCall::Nack { requeue: true, .. })));
        assert_eq!(broker.depth("batch"), 1);
    }

    #[tokio::test]
    async fn stopped_worker_takes_nothing() {
        let broker = MemoryBroker::new();
        broker.push("batch", "item-1");
        let channel = broker.connect().await.unwrap();

        let report = PullConsumer::new("batch")
            .drain(channel.as_ref(), &Recording::default(), &|| false)
            .await
            .unwrap();

        assert_eq!(report, DrainReport::default());
        assert_eq!(broker.gets("batch"), 0);
    }
}
