//! Message broker seam.
//!
//! The broker provides at-least-once delivery with manual acknowledgement
//! and a per-channel prefetch cap. A channel is opened by, and owned by, one
//! worker; dropping it returns its unacknowledged messages to their queues.
//!
//! Exchanges are flattened: the routing key names the destination queue.

pub mod memory;

use crate::error::Result;
use crate::model::{DeliveryTag, JobMessage};
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::{BrokerCall, MemoryBroker};

/// Push deliveries for one consumer, in broker delivery order.
pub type Deliveries = tokio::sync::mpsc::Receiver<JobMessage>;

/// Connection factory.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new channel. Credentials come from the broker's own config.
    async fn connect(&self) -> Result<Arc<dyn Channel>>;
}

/// One broker session.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Cap the number of unacknowledged deliveries on this channel.
    /// Zero means no cap.
    async fn set_qos(&self, prefetch: u16) -> Result<()>;

    /// Register a consumer. With `auto_ack` the broker retires each message
    /// as soon as it is handed out.
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<Deliveries>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Messages ready for delivery on `queue`.
    async fn message_count(&self, queue: &str) -> Result<u64>;

    /// Pull a single message, if one is ready.
    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<JobMessage>>;

    /// Release the channel. Unacknowledged messages go back to their queues.
    async fn close(&self) -> Result<()>;
}
