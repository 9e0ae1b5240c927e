//! Broker on top of pgmq.
//!
//! A read hides a message for the visibility timeout; ack archives it,
//! nack with requeue makes it visible again at once. A message nobody
//! settles reappears when its timeout lapses, which gives at-least-once
//! delivery even across crashes. Payloads travel as `{"data": "<base64>"}`.

use super::Db;
use super::pgmq::PgmqMessage;
use crate::broker::{Broker, Channel, Deliveries};
use crate::error::{Error, Result};
use crate::model::{DeliveryTag, JobMessage};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct PgmqBroker {
    db: Db,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgmqBroker {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// How long a read message stays hidden before it is redelivered.
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Pause between reads of an empty queue.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        sqlx::query("SELECT 1")
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Broker(format!("pgmq unavailable: {e}")))?;
        let inner = Arc::new(Inner {
            db: self.db.clone(),
            vt_seconds: self.visibility_timeout.as_secs().clamp(1, i32::MAX as u64) as i32,
            poll_interval: self.poll_interval,
            prefetch: AtomicU16::new(0),
            next_tag: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
            settled: Notify::new(),
            created: Mutex::new(HashSet::new()),
        });
        Ok(Arc::new(PgmqChannel {
            inner,
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InFlight {
    queue: String,
    msg_id: i64,
}

struct Inner {
    db: Db,
    vt_seconds: i32,
    poll_interval: Duration,
    prefetch: AtomicU16,
    next_tag: AtomicU64,
    in_flight: Mutex<HashMap<DeliveryTag, InFlight>>,
    settled: Notify,
    /// Queues this channel already ensured exist.
    created: Mutex<HashSet<String>>,
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<DeliveryTag, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        let known = self
            .created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue);
        if !known {
            self.db.create_queue(queue).await?;
            self.created
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(queue.to_string());
        }
        Ok(())
    }

    fn under_prefetch(&self) -> bool {
        let limit = self.prefetch.load(Ordering::SeqCst);
        limit == 0 || self.in_flight().len() < limit as usize
    }

    /// Read one message and register it, or archive it straight away with
    /// `auto_ack`.
    async fn take(&self, queue: &str, auto_ack: bool) -> Result<Option<JobMessage>> {
        let Some(message) = self.db.read_from_queue(queue, self.vt_seconds).await? else {
            return Ok(None);
        };
        let payload = decode_payload(&message);
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        if auto_ack {
            self.db.archive_message(queue, message.msg_id).await?;
        } else {
            self.in_flight().insert(
                tag,
                InFlight {
                    queue: queue.to_string(),
                    msg_id: message.msg_id,
                },
            );
        }
        Ok(Some(JobMessage {
            tag,
            payload,
            redelivered: message.read_ct > 1,
        }))
    }

    fn settle(&self, tag: DeliveryTag) -> Result<InFlight> {
        let entry = self
            .in_flight()
            .remove(&tag)
            .ok_or_else(|| Error::Broker(format!("unknown delivery tag {tag}")))?;
        self.settled.notify_waiters();
        Ok(entry)
    }
}

pub struct PgmqChannel {
    inner: Arc<Inner>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PgmqChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Broker("pgmq channel is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn stop_consumers(&self) {
        for handle in self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl Channel for PgmqChannel {
    async fn set_qos(&self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.inner.prefetch.store(prefetch, Ordering::SeqCst);
        self.inner.settled.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<Deliveries> {
        self.ensure_open()?;
        self.inner.ensure_queue(queue).await?;
        let (tx, rx) = mpsc::channel(1);
        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let settled = inner.settled.notified();
                tokio::pin!(settled);
                settled.as_mut().enable();

                if !inner.under_prefetch() {
                    tokio::select! {
                        _ = settled => continue,
                        _ = tx.closed() => break,
                    }
                }

                match inner.take(&queue, auto_ack).await {
                    Ok(Some(message)) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(inner.poll_interval) => {}
                            _ = tx.closed() => break,
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "pgmq read failed, consumer stopping");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "pgmq consumer exited");
        });
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(rx)
    }

    async fn publish(&self, _exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.inner.ensure_queue(routing_key).await?;
        let body = serde_json::json!({ "data": STANDARD.encode(payload) });
        self.inner.db.send_to_queue(routing_key, &body).await?;
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        let entry = self.inner.settle(tag)?;
        self.inner.db.archive_message(&entry.queue, entry.msg_id).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let entry = self.inner.settle(tag)?;
        if requeue {
            self.inner.db.set_visibility(&entry.queue, entry.msg_id, 0).await
        } else {
            self.inner.db.archive_message(&entry.queue, entry.msg_id).await
        }
    }

    /// pgmq reports total queue length, which includes messages hidden by
    /// another reader's visibility timeout.
    async fn message_count(&self, queue: &str) -> Result<u64> {
        self.ensure_open()?;
        self.inner.ensure_queue(queue).await?;
        self.inner.db.queue_length(queue).await
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<JobMessage>> {
        self.ensure_open()?;
        self.inner.ensure_queue(queue).await?;
        self.inner.take(queue, auto_ack).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_consumers();
        let pending: Vec<InFlight> = self.inner.in_flight().drain().map(|(_, m)| m).collect();
        for message in pending {
            if let Err(e) = self.inner.db.set_visibility(&message.queue, message.msg_id, 0).await {
                warn!(queue = %message.queue, msg_id = message.msg_id, error = %e,
                    "failed to release message on close, it reappears after its timeout");
            }
        }
        Ok(())
    }
}

impl Drop for PgmqChannel {
    fn drop(&mut self) {
        // Unsettled messages reappear once their visibility timeout lapses.
        self.stop_consumers();
    }
}

/// Unwrap `{"data": "<base64>"}`; anything else is passed through as JSON.
fn decode_payload(message: &PgmqMessage) -> Vec<u8> {
    message
        .message
        .get("data")
        .and_then(serde_json::Value::as_str)
        .and_then(|data| STANDARD.decode(data).ok())
        .unwrap_or_else(|| message.message.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(value: serde_json::Value) -> PgmqMessage {
        PgmqMessage {
            msg_id: 1,
            read_ct: 1,
            enqueued_at: Utc::now(),
            message: value,
        }
    }

    #[test]
    fn decodes_wrapped_payloads() {
        let wrapped = serde_json::json!({ "data": STANDARD.encode(b"end-of-batch") });
        assert_eq!(decode_payload(&message(wrapped)), b"end-of-batch");
    }

    #[test]
    fn foreign_json_passes_through() {
        let raw = serde_json::json!({ "reference": "F-1" });
        assert_eq!(decode_payload(&message(raw)), br#"{"reference":"F-1"}"#);
    }
}
