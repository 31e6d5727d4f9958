//! TaskQueue — at-least-once delivery of serialized tasks.
//!
//! Messages are JSON-encoded [`Task`]s. A consumer receives a [`Delivery`]
//! and must `ack` it once handled; a delivery that is nacked, or dropped
//! without either, goes back to the head of the queue marked as
//! redelivered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use virtflow_core::Task;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode task: {0}")]
    Encode(String),

    #[error("queue is closed")]
    Closed,

    #[error("queue is full ({0} messages)")]
    Full(usize),
}

impl QueueError {
    /// Whether the same publish may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Full(_))
    }
}

/// The queue collaborator.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task for the workers.
    async fn publish(&self, task: &Task) -> Result<(), QueueError>;

    /// Wait for the next message. `None` once the queue is closed and drained.
    async fn consume(&self) -> Option<Delivery>;
}

/// Settles one delivery with the queue that produced it.
pub trait Acknowledger: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

/// One message handed to a consumer.
pub struct Delivery {
    payload: Vec<u8>,
    redelivered: bool,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redelivered,
            acker: Some(acker),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether this message was delivered before and not acknowledged.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// The message was handled; the queue forgets it.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    /// The message was not handled; the queue delivers it again.
    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

// ── In-memory queue ───────────────────────────────────────────────

struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

struct Inner {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-local queue with redelivery of unacknowledged messages.
///
/// `capacity` bounds fresh publishes only; redeliveries always fit.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                messages: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                capacity,
            }),
        }
    }

    /// Enqueue raw bytes. Used to inject payloads that are not valid tasks.
    pub fn publish_raw(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        {
            let mut messages = self.inner.lock();
            if messages.len() >= self.inner.capacity {
                return Err(QueueError::Full(messages.len()));
            }
            messages.push_back(Message {
                payload,
                redelivered: false,
            });
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Refuse new publishes and wake every waiting consumer. Messages
    /// already queued are still delivered.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        debug!("memory queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Messages waiting for a consumer.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(task).map_err(|e| QueueError::Encode(e.to_string()))?;
        self.publish_raw(payload)
    }

    async fn consume(&self) -> Option<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            let next = self.inner.lock().pop_front();
            if let Some(message) = next {
                let acker = MemoryAcker {
                    inner: self.inner.clone(),
                    payload: Some(message.payload.clone()),
                };
                return Some(Delivery::new(
                    message.payload,
                    message.redelivered,
                    Box::new(acker),
                ));
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    payload: Option<Vec<u8>>,
}

impl Acknowledger for MemoryAcker {
    fn ack(self: Box<Self>) {}

    fn nack(mut self: Box<Self>) {
        if let Some(payload) = self.payload.take() {
            self.inner.lock().push_front(Message {
                payload,
                redelivered: true,
            });
            self.inner.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use virtflow_core::SchedulingRequest;

    fn task(id: &str) -> Task {
        Task::with_id(
            id,
            SchedulingRequest {
                requested_cpu: 2,
                requested_memory: 4096,
                requested_pool: "default".to_string(),
                dedicated: false,
            },
        )
    }

    fn decode(delivery: &Delivery) -> Task {
        serde_json::from_slice(delivery.payload()).unwrap()
    }

    #[tokio::test]
    async fn publish_then_consume_in_order() {
        let queue = MemoryQueue::with_capacity(10);
        queue.publish(&task("a")).await.unwrap();
        queue.publish(&task("b")).await.unwrap();

        let first = queue.consume().await.unwrap();
        assert_eq!(decode(&first).task_id, "a");
        assert!(!first.redelivered());
        first.ack();

        let second = queue.consume().await.unwrap();
        assert_eq!(decode(&second).task_id, "b");
        second.ack();

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn nacked_message_is_redelivered_first() {
        let queue = MemoryQueue::with_capacity(10);
        queue.publish(&task("a")).await.unwrap();
        queue.publish(&task("b")).await.unwrap();

        queue.consume().await.unwrap().nack();

        let again = queue.consume().await.unwrap();
        assert_eq!(decode(&again).task_id, "a");
        assert!(again.redelivered());
        again.ack();
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let queue = MemoryQueue::with_capacity(10);
        queue.publish(&task("a")).await.unwrap();

        {
            let _delivery = queue.consume().await.unwrap();
            assert!(queue.is_empty());
        }

        assert_eq!(queue.len(), 1);
        let again = queue.consume().await.unwrap();
        assert!(again.redelivered());
        again.ack();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn consumer_wakes_on_publish() {
        let queue = MemoryQueue::with_capacity(10);
        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.consume().await.map(|d| decode(&d).task_id) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&task("late")).await.unwrap();

        let id = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn close_refuses_publishes_and_releases_consumers() {
        let queue = MemoryQueue::with_capacity(10);
        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.consume().await.is_none() }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert!(consumer.await.unwrap());
        assert!(matches!(
            queue.publish(&task("a")).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn closed_queue_still_drains() {
        let queue = MemoryQueue::with_capacity(10);
        queue.publish(&task("a")).await.unwrap();
        queue.close();

        queue.consume().await.unwrap().ack();
        assert!(queue.consume().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_rejects_publish() {
        let queue = MemoryQueue::with_capacity(1);
        queue.publish(&task("a")).await.unwrap();
        assert!(matches!(
            queue.publish(&task("b")).await,
            Err(QueueError::Full(1))
        ));
    }

    #[test]
    fn only_full_is_transient() {
        assert!(QueueError::Full(3).is_transient());
        assert!(!QueueError::Closed.is_transient());
        assert!(!QueueError::Encode("bad".into()).is_transient());
    }
}
