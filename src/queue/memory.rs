//! In-process broker with the same delivery contract as the durable queue.
//!
//! Used by standalone mode and by the pipeline tests. Prefetch is enforced with one semaphore
//! per consumer: every delivery holds a permit until it is settled, and a delivery dropped
//! without being settled goes back to the tail of the queue flagged as redelivered.

use super::{DeadLetter, Delivery, JobConsumer, JobMessage, JobQueue, QueueError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

struct Envelope {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct Shared {
    ready: Mutex<VecDeque<Envelope>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    notify: Notify,
    closed: AtomicBool,
    published: AtomicU64,
    failing_publishes: AtomicU32,
    failing_dead_letters: AtomicU32,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

impl Shared {
    fn push(&self, envelope: Envelope) {
        self.ready.lock().push_back(envelope);
        self.notify.notify_one();
    }
}

/// Cloneable handle to an in-process queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for a consumer.
    pub fn depth(&self) -> usize {
        self.shared.ready.lock().len()
    }

    /// Successful `publish` calls, excluding requeues.
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    /// Dead letters recorded so far.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dead_letters.lock().clone()
    }

    /// Make the next `count` publishes fail as if the broker were unreachable.
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` dead-letter publishes fail.
    pub fn fail_next_dead_letters(&self, count: u32) {
        self.shared.failing_dead_letters.store(count, Ordering::SeqCst);
    }

    /// Push a raw payload, bypassing encoding.
    pub fn publish_raw(&self, payload: Vec<u8>) {
        self.shared.push(Envelope {
            payload,
            redelivered: false,
        });
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if take_failure(&self.shared.failing_publishes) {
            return Err(QueueError::Broker("publish rejected".into()));
        }
        let payload = message.to_bytes()?;
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        self.shared.push(Envelope {
            payload,
            redelivered: false,
        });
        Ok(())
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        if take_failure(&self.shared.failing_dead_letters) {
            return Err(QueueError::Broker("dead-letter publish rejected".into()));
        }
        self.shared.dead_letters.lock().push(letter.clone());
        Ok(())
    }

    async fn consumer(&self, prefetch: u16) -> Result<Box<dyn JobConsumer>, QueueError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(Box::new(MemoryConsumer {
            shared: self.shared.clone(),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl JobConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Box<dyn Delivery>>, QueueError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Closed)?;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let next = self.shared.ready.lock().pop_front();
            if let Some(envelope) = next {
                return Ok(Some(Box::new(MemoryDelivery {
                    shared: self.shared.clone(),
                    envelope: Some(envelope),
                    _permit: permit,
                })));
            }

            notified.await;
        }
    }
}

struct MemoryDelivery {
    shared: Arc<Shared>,
    envelope: Option<Envelope>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        self.envelope
            .as_ref()
            .map(|envelope| envelope.payload.as_slice())
            .unwrap_or_default()
    }

    fn redelivered(&self) -> bool {
        self.envelope
            .as_ref()
            .is_some_and(|envelope| envelope.redelivered)
    }

    async fn ack(&mut self) -> Result<(), QueueError> {
        self.envelope
            .take()
            .map(|_| ())
            .ok_or(QueueError::AlreadySettled)
    }

    async fn requeue(&mut self, updated: &JobMessage) -> Result<(), QueueError> {
        if self.envelope.is_none() {
            return Err(QueueError::AlreadySettled);
        }
        let payload = updated.to_bytes()?;
        self.envelope = None;
        self.shared.push(Envelope {
            payload,
            redelivered: false,
        });
        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if let Some(mut envelope) = self.envelope.take() {
            envelope.redelivered = true;
            self.shared.push(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlobLocation;
    use std::time::Duration;
    use time::OffsetDateTime;

    fn message(job_id: &str) -> JobMessage {
        JobMessage {
            job_id: job_id.into(),
            document_id: "doc".into(),
            blob_location: BlobLocation::new("docs", "k"),
            content_type: "text/plain".into(),
            size_bytes: 1,
            attempt_count: 0,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn acked_messages_are_not_redelivered() {
        let queue = MemoryQueue::new();
        queue.publish(&message("a")).await.expect("publish");
        let mut consumer = queue.consumer(1).await.expect("consumer");

        let mut delivery = consumer.next_delivery().await.expect("next").expect("delivery");
        delivery.ack().await.expect("ack");
        drop(delivery);

        assert_eq!(queue.depth(), 0);
        let mut fresh = queue.consumer(1).await.expect("consumer");
        let next = tokio::time::timeout(Duration::from_millis(50), fresh.next_delivery()).await;
        assert!(next.is_err(), "acked message must not come back");
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let queue = MemoryQueue::new();
        queue.publish(&message("a")).await.expect("publish");
        let mut consumer = queue.consumer(1).await.expect("consumer");

        let first = consumer.next_delivery().await.expect("next").expect("delivery");
        assert!(!first.redelivered());
        drop(first);

        let mut second = consumer.next_delivery().await.expect("next").expect("delivery");
        assert!(second.redelivered());
        let parsed = JobMessage::from_bytes(second.payload()).expect("payload");
        assert_eq!(parsed.job_id, "a");
        second.ack().await.expect("ack");
        assert!(matches!(second.ack().await, Err(QueueError::AlreadySettled)));
    }

    #[tokio::test]
    async fn prefetch_bounds_unsettled_deliveries() {
        let queue = MemoryQueue::new();
        for id in ["a", "b", "c"] {
            queue.publish(&message(id)).await.expect("publish");
        }
        let mut consumer = queue.consumer(2).await.expect("consumer");
        let mut first = consumer.next_delivery().await.expect("next").expect("delivery");
        let _second = consumer.next_delivery().await.expect("next").expect("delivery");

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), consumer.next_delivery()).await;
        assert!(blocked.is_err(), "third delivery must wait for a settle");

        first.ack().await.expect("ack");
        drop(first);
        let third = consumer.next_delivery().await.expect("next").expect("delivery");
        assert_eq!(JobMessage::from_bytes(third.payload()).expect("payload").job_id, "c");
    }

    #[tokio::test]
    async fn requeue_replaces_payload() {
        let queue = MemoryQueue::new();
        queue.publish(&message("a")).await.expect("publish");
        let mut consumer = queue.consumer(1).await.expect("consumer");
        let mut delivery = consumer.next_delivery().await.expect("next").expect("delivery");
        let updated = message("a").for_retry(2);
        delivery.requeue(&updated).await.expect("requeue");
        drop(delivery);

        let next = consumer.next_delivery().await.expect("next").expect("delivery");
        assert_eq!(JobMessage::from_bytes(next.payload()).expect("payload").attempt_count, 2);
        assert_eq!(queue.published_count(), 1);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumers() {
        let queue = MemoryQueue::new();
        let mut consumer = queue.consumer(1).await.expect("consumer");
        let waiter = tokio::spawn(async move { consumer.next_delivery().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await.expect("close");

        let outcome = waiter.await.expect("join").expect("next");
        assert!(outcome.is_none());
        assert!(matches!(
            queue.publish(&message("late")).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn injected_publish_failures_are_consumed() {
        let queue = MemoryQueue::new();
        queue.fail_next_publishes(1);
        assert!(queue.publish(&message("a")).await.is_err());
        queue.publish(&message("b")).await.expect("publish");
        assert_eq!(queue.depth(), 1);
    }
}
