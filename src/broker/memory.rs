//! In-memory broker for tests and local runs.
//!
//! Honours prefetch per channel, redelivers nacked messages at the head of
//! their queue, and records every ack/nack/get/publish call so tests can
//! assert on acknowledgement behaviour.

use super::{Broker, Channel, Deliveries};
use crate::error::{Error, Result};
use crate::model::{DeliveryTag, JobMessage};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

/// A broker operation, as recorded by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Publish { queue: String },
    Get { queue: String },
    Ack(DeliveryTag),
    Nack { tag: DeliveryTag, requeue: bool },
}

struct Ready {
    payload: Vec<u8>,
    redelivered: bool,
}

struct InFlight {
    queue: String,
    channel: u64,
    payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Ready>>,
    unacked: HashMap<DeliveryTag, InFlight>,
    calls: Vec<BrokerCall>,
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    next_tag: AtomicU64,
    next_channel: AtomicU64,
    unavailable: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out the head of `queue` if the channel is under its prefetch cap.
    fn take(&self, queue: &str, channel: u64, prefetch: u16, auto_ack: bool) -> Option<JobMessage> {
        let mut state = self.lock();
        if prefetch > 0 {
            let outstanding = state
                .unacked
                .values()
                .filter(|m| m.channel == channel)
                .count();
            if outstanding >= prefetch as usize {
                return None;
            }
        }
        let ready = state.queues.get_mut(queue)?.pop_front()?;
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        if !auto_ack {
            state.unacked.insert(
                tag,
                InFlight {
                    queue: queue.to_string(),
                    channel,
                    payload: ready.payload.clone(),
                },
            );
        }
        Some(JobMessage {
            tag,
            payload: ready.payload,
            redelivered: ready.redelivered,
        })
    }

    /// Put a delivery back at the head of its queue.
    fn requeue(&self, tag: DeliveryTag) {
        let mut state = self.lock();
        if let Some(msg) = state.unacked.remove(&tag) {
            state
                .queues
                .entry(msg.queue)
                .or_default()
                .push_front(Ready {
                    payload: msg.payload,
                    redelivered: true,
                });
        }
        drop(state);
        self.wake.notify_waiters();
    }

    fn release_channel(&self, channel: u64) {
        let tags: Vec<DeliveryTag> = self
            .lock()
            .unacked
            .iter()
            .filter(|(_, m)| m.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            self.requeue(tag);
        }
    }
}

/// Process-local broker. Cheap to clone; clones share queues.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                next_tag: AtomicU64::new(0),
                next_channel: AtomicU64::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a payload without going through a channel.
    pub fn push(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Ready {
                payload: payload.into(),
                redelivered: false,
            });
        self.shared.wake.notify_waiters();
    }

    /// Ready messages on `queue`, as UTF-8.
    pub fn peek(&self, queue: &str) -> Vec<String> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.iter()
                    .map(|r| String::from_utf8_lossy(&r.payload).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub fn unacked(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.shared.lock().calls.clone()
    }

    pub fn acks(&self) -> Vec<DeliveryTag> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Ack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn nacks(&self) -> Vec<(DeliveryTag, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Nack { tag, requeue } => Some((tag, requeue)),
                _ => None,
            })
            .collect()
    }

    pub fn gets(&self, queue: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BrokerCall::Get { queue: q } if q == queue))
            .count()
    }

    /// Make `connect` fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Broker("memory broker unavailable".to_string()));
        }
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(channel = id, "memory channel opened");
        Ok(Arc::new(MemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
            prefetch: Arc::new(AtomicU16::new(0)),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
    prefetch: Arc<AtomicU16>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Broker(format!("channel {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        self.shared.release_channel(self.id);
        debug!(channel = self.id, "memory channel closed");
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn set_qos(&self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<Deliveries> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::clone(&self.shared);
        let prefetch = Arc::clone(&self.prefetch);
        let queue = queue.to_string();
        let channel = self.id;

        let handle = tokio::spawn(async move {
            loop {
                let notified = shared.wake.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let limit = prefetch.load(Ordering::SeqCst);
                if let Some(msg) = shared.take(&queue, channel, limit, auto_ack) {
                    let tag = msg.tag;
                    if tx.send(msg).await.is_err() {
                        shared.requeue(tag);
                        break;
                    }
                    continue;
                }

                tokio::select! {
                    _ = notified => {}
                    _ = tx.closed() => break,
                }
            }
        });
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(rx)
    }

    async fn publish(&self, _exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            state.calls.push(BrokerCall::Publish {
                queue: routing_key.to_string(),
            });
            state
                .queues
                .entry(routing_key.to_string())
                .or_default()
                .push_back(Ready {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
        }
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            state.calls.push(BrokerCall::Ack(tag));
            if state.unacked.remove(&tag).is_none() {
                return Err(Error::Broker(format!("unknown delivery tag {tag}")));
            }
        }
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            state.calls.push(BrokerCall::Nack { tag, requeue });
            if !state.unacked.contains_key(&tag) {
                return Err(Error::Broker(format!("unknown delivery tag {tag}")));
            }
            if !requeue {
                state.unacked.remove(&tag);
            }
        }
        if requeue {
            self.shared.requeue(tag);
        } else {
            self.shared.wake.notify_waiters();
        }
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.shared.lock().queues.get(queue).map_or(0, VecDeque::len) as u64)
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<JobMessage>> {
        self.ensure_open()?;
        self.shared.lock().calls.push(BrokerCall::Get {
            queue: queue.to_string(),
        });
        Ok(self.shared.take(queue, self.id, 0, auto_ack))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn prefetch_caps_outstanding_deliveries() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.push("q", format!("m{i}"));
        }
        let channel = broker.connect().await.unwrap();
        channel.set_qos(2).await.unwrap();
        let mut rx = channel.consume("q", false).await.unwrap();

        let first = rx.recv().await.unwrap();
        let _second = rx.recv().await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(third.is_err(), "third delivery must wait for an ack");

        channel.ack(first.tag).await.unwrap();
        let third = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.payload, b"m2");
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_at_head() {
        let broker = MemoryBroker::new();
        broker.push("q", "a");
        broker.push("q", "b");
        let channel = broker.connect().await.unwrap();
        let msg = channel.get("q", false).await.unwrap().unwrap();
        channel.nack(msg.tag, true).await.unwrap();
        let again = channel.get("q", false).await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn closing_a_channel_returns_unacked_messages() {
        let broker = MemoryBroker::new();
        broker.push("q", "a");
        let channel = broker.connect().await.unwrap();
        let _msg = channel.get("q", false).await.unwrap().unwrap();
        assert_eq!(broker.depth("q"), 0);
        channel.close().await.unwrap();
        assert_eq!(broker.depth("q"), 1);
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn unavailable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        assert!(broker.connect().await.is_err());
    }
}
