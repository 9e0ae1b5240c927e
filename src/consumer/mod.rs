//! Broker subscribers that feed a worker.
//!
//! [`QueueConsumer`] is the push variant: the broker delivers, the consumer
//! hands each message to a [`MessageHandler`] and settles it with exactly one
//! ack or nack. When the ack happens depends on [`AckMode`]. The pull variant
//! for sentinel-terminated batches lives in [`pull`].

pub mod pull;

use crate::broker::Channel;
use crate::error::{Error, Result};
use crate::model::JobMessage;
use crate::telemetry::metrics;
use crate::worker::JobContext;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, error, warn};

pub use pull::{BatchHandler, DrainReport, END_OF_BATCH, PullConsumer};

/// When a delivery is acknowledged relative to processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Ack on receipt, then process. A failed message is lost, never
    /// redelivered.
    BeforeProcessing,
    /// Process, then ack. A failure nacks with requeue so the broker
    /// redelivers.
    AfterProcessing,
}

impl std::str::FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "before" => Ok(AckMode::BeforeProcessing),
            "after" => Ok(AckMode::AfterProcessing),
            other => Err(format!("expected 'before' or 'after', got '{other}'")),
        }
    }
}

/// Processing entry point for push deliveries.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. The channel is the consumer's own and may be used
    /// to publish follow-up messages.
    async fn handle(&self, message: &JobMessage, channel: &dyn Channel) -> Result<()>;
}

/// How a delivery left the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Disposition::Acked => "ack",
            Disposition::Requeued => "nack",
        }
    }
}

/// Outcome of [`QueueConsumer::on_delivery`].
#[derive(Debug)]
pub struct Settled {
    pub disposition: Disposition,
    /// The handler error, if processing failed.
    pub failure: Option<Error>,
}

/// Push consumer bound to one queue.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    queue: String,
    mode: AckMode,
    prefetch: u16,
}

impl QueueConsumer {
    pub fn new(queue: impl Into<String>, mode: AckMode) -> Self {
        Self {
            queue: queue.into(),
            mode,
            prefetch: 1,
        }
    }

    /// Cap unacknowledged deliveries on the consumer's channel.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    /// Process one delivery and settle it.
    ///
    /// Issues exactly one `ack` or one `nack` for the message's tag. An `Err`
    /// means the settle call itself failed; the broker then still holds the
    /// message and will redeliver it once the channel closes.
    pub async fn on_delivery(
        &self,
        channel: &dyn Channel,
        handler: &dyn MessageHandler,
        message: &JobMessage,
    ) -> Result<Settled> {
        match self.mode {
            AckMode::BeforeProcessing => {
                channel.ack(message.tag).await?;
                let failure = handler.handle(message, channel).await.err();
                Ok(Settled {
                    disposition: Disposition::Acked,
                    failure,
                })
            }
            AckMode::AfterProcessing => match handler.handle(message, channel).await {
                Ok(()) => {
                    channel.ack(message.tag).await?;
                    Ok(Settled {
                        disposition: Disposition::Acked,
                        failure: None,
                    })
                }
                Err(e) => {
                    channel.nack(message.tag, true).await?;
                    Ok(Settled {
                        disposition: Disposition::Requeued,
                        failure: Some(e),
                    })
                }
            },
        }
    }

    /// Consume until the worker is stopped. Opens a channel of its own and
    /// closes it on return. Returns the number of deliveries settled.
    pub async fn run(&self, cx: &JobContext, handler: &dyn MessageHandler) -> Result<u64> {
        let channel = cx.app().broker.connect().await?;
        let result = self.consume(cx, channel.as_ref(), handler).await;
        if let Err(e) = channel.close().await {
            warn!(queue = %self.queue, error = %e, "failed to close consumer channel");
        }
        result
    }

    async fn consume(
        &self,
        cx: &JobContext,
        channel: &dyn Channel,
        handler: &dyn MessageHandler,
    ) -> Result<u64> {
        channel.set_qos(self.prefetch).await?;
        let mut deliveries = channel.consume(&self.queue, false).await?;
        cx.set_action(format!("consuming {}", self.queue));
        debug!(worker = %cx.worker_name(), queue = %self.queue, "consumer registered");

        let mut settled_count = 0;
        loop {
            let message = tokio::select! {
                biased;
                _ = cx.stopped() => break,
                next = deliveries.recv() => match next {
                    Some(message) => message,
                    None => {
                        return Err(Error::Broker(format!(
                            "delivery stream for {} closed",
                            self.queue
                        )));
                    }
                },
            };

            let settled = self.on_delivery(channel, handler, &message).await?;
            settled_count += 1;
            metrics::deliveries_settled().add(
                1,
                &[
                    KeyValue::new("worker", cx.worker_name().to_string()),
                    KeyValue::new("disposition", settled.disposition.as_str()),
                ],
            );

            let Some(e) = settled.failure else {
                continue;
            };
            match self.mode {
                AckMode::AfterProcessing => {
                    warn!(
                        worker = %cx.worker_name(),
                        tag = %message.tag,
                        error = %e,
                        "processing failed, message requeued"
                    );
                }
                AckMode::BeforeProcessing => {
                    error!(
                        worker = %cx.worker_name(),
                        tag = %message.tag,
                        error = %e,
                        "processing failed after ack, message dropped"
                    );
                    cx.app()
                        .alert(
                            &format!("{} dropped a message", cx.worker_name()),
                            &format!(
                                "Queue: {}\nError: {e}\n\nPayload:\n{}",
                                self.queue,
                                message.text()
                            ),
                        )
                        .await;
                }
            }
        }
        Ok(settled_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerCall, MemoryBroker};
    use crate::model::DeliveryTag;

    struct FailOn(&'static str);

    #[async_trait]
    impl MessageHandler for FailOn {
        async fn handle(&self, message: &JobMessage, _channel: &dyn Channel) -> Result<()> {
            if message.text() == self.0 {
                Err(Error::Other("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn deliver(broker: &MemoryBroker, payload: &str) -> (std::sync::Arc<dyn Channel>, JobMessage) {
        broker.push("q", payload);
        let channel = broker.connect().await.unwrap();
        let message = channel.get("q", false).await.unwrap().unwrap();
        (channel, message)
    }

    fn settles(broker: &MemoryBroker, tag: DeliveryTag) -> Vec<BrokerCall> {
        broker
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BrokerCall::Ack(t) | BrokerCall::Nack { tag: t, .. } if *t == tag))
            .collect()
    }

    #[test]
    fn ack_mode_parses() {
        assert_eq!("before".parse::<AckMode>().unwrap(), AckMode::BeforeProcessing);
        assert_eq!("after".parse::<AckMode>().unwrap(), AckMode::AfterProcessing);
        assert!("never".parse::<AckMode>().is_err());
    }

    #[tokio::test]
    async fn ack_before_acks_even_when_processing_fails() {
        let broker = MemoryBroker::new();
        let (channel, message) = deliver(&broker, "bad").await;
        let consumer = QueueConsumer::new("q", AckMode::BeforeProcessing);

        let settled = consumer
            .on_delivery(channel.as_ref(), &FailOn("bad"), &message)
            .await
            .unwrap();

        assert_eq!(settled.disposition, Disposition::Acked);
        assert!(settled.failure.is_some());
        assert_eq!(settles(&broker, message.tag), vec![BrokerCall::Ack(message.tag)]);
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn ack_after_requeues_on_failure() {
        let broker = MemoryBroker::new();
        let (channel, message) = deliver(&broker, "bad").await;
        let consumer = QueueConsumer::new("q", AckMode::AfterProcessing);

        let settled = consumer
            .on_delivery(channel.as_ref(), &FailOn("bad"), &message)
            .await
            .unwrap();

        assert_eq!(settled.disposition, Disposition::Requeued);
        assert_eq!(
            settles(&broker, message.tag),
            vec![BrokerCall::Nack {
                tag: message.tag,
                requeue: true
            }]
        );
        assert_eq!(broker.depth("q"), 1);
    }

    #[tokio::test]
    async fn ack_after_acks_on_success() {
        let broker = MemoryBroker::new();
        let (channel, message) = deliver(&broker, "good").await;
        let consumer = QueueConsumer::new("q", AckMode::AfterProcessing);

        let settled = consumer
            .on_delivery(channel.as_ref(), &FailOn("bad"), &message)
            .await
            .unwrap();

        assert_eq!(settled.disposition, Disposition::Acked);
        assert!(settled.failure.is_none());
        assert_eq!(settles(&broker, message.tag), vec![BrokerCall::Ack(message.tag)]);
    }
}
