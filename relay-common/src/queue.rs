use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

use crate::event::Event;

/// Enumeration of errors for operations on the bounded event queue.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("queue is closed")]
    Closed,
}

/// What a producer does with an event when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullQueuePolicy {
    /// Wait up to the given duration for room, then drop the event.
    Block(Duration),
    /// Drop the event right away.
    Drop,
}

/// Create a bounded FIFO queue holding at most `capacity` events, and at least one.
///
/// The producer side can be cloned and handed to every incarnation of a
/// source consumer. The consumer side is owned by the supervisor.
pub fn bounded(capacity: usize, policy: FullQueuePolicy) -> (QueueProducer, QueueConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);

    (
        QueueProducer {
            sender: tx,
            capacity,
            policy,
        },
        QueueConsumer {
            receiver: rx,
            capacity,
        },
    )
}

#[derive(Clone, Debug)]
pub struct QueueProducer {
    sender: mpsc::Sender<Event>,
    capacity: usize,
    policy: FullQueuePolicy,
}

impl QueueProducer {
    /// Put an event in the queue.
    ///
    /// With `block = false` this fails with `Full` right away when the queue is at capacity.
    /// Otherwise it waits up to `timeout` for room before failing with `Full`.
    pub async fn put(&self, event: Event, block: bool, timeout: Duration) -> Result<(), QueueError> {
        let result = if block {
            self.sender
                .send_timeout(event, timeout)
                .await
                .map_err(|error| match error {
                    SendTimeoutError::Timeout(_) => QueueError::Full,
                    SendTimeoutError::Closed(_) => QueueError::Closed,
                })
        } else {
            self.sender.try_send(event).map_err(|error| match error {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Closed(_) => QueueError::Closed,
            })
        };

        metrics::gauge!("relay_queue_depth").set(self.depth() as f64);
        result
    }

    /// Put an event in the queue according to the configured `FullQueuePolicy`.
    ///
    /// Events refused by a full queue are logged and counted before `Full` is returned.
    /// `Closed` means nobody will ever read the queue again.
    pub async fn offer(&self, event: Event) -> Result<(), QueueError> {
        let result = match self.policy {
            FullQueuePolicy::Block(timeout) => self.put(event, true, timeout).await,
            FullQueuePolicy::Drop => self.put(event, false, Duration::ZERO).await,
        };

        if let Err(QueueError::Full) = result {
            warn!(capacity = self.capacity, "queue is full, dropping event");
            metrics::counter!("relay_queue_dropped_events_total").increment(1);
        }
        result
    }

    /// Number of events currently waiting in the queue.
    pub fn depth(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
pub struct QueueConsumer {
    receiver: mpsc::Receiver<Event>,
    capacity: usize,
}

impl QueueConsumer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the oldest event from the queue.
    ///
    /// With `block = false` this fails with `Empty` right away if nothing is queued.
    /// Otherwise it waits at most `timeout`. A queue without producers also reports `Empty`,
    /// so callers never wait on it indefinitely.
    pub async fn get(&mut self, block: bool, timeout: Duration) -> Result<Event, QueueError> {
        if !block {
            return self.receiver.try_recv().map_err(|error| match error {
                TryRecvError::Empty | TryRecvError::Disconnected => QueueError::Empty,
            });
        }

        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => {
                // No producer left: behave like an elapsed timeout rather than spinning.
                tokio::time::sleep(timeout).await;
                Err(QueueError::Empty)
            }
            Err(_) => Err(QueueError::Empty),
        }
    }

    /// Gather up to `limit` events.
    ///
    /// Every `Empty` outcome counts as one retry, and gathering stops after
    /// `max_retries` of them, so a batch takes at most `limit` successful gets plus
    /// `max_retries * timeout` of waiting. Returns whatever was collected, possibly nothing.
    pub async fn drain_batch(
        &mut self,
        limit: usize,
        block: bool,
        timeout: Duration,
        max_retries: usize,
    ) -> Vec<Event> {
        let mut batch = Vec::with_capacity(limit.min(1024));
        let mut retries = 0;

        while batch.len() < limit && retries < max_retries {
            match self.get(block, timeout).await {
                Ok(event) => batch.push(event),
                Err(_) => {
                    retries += 1;
                    debug!(retries, "empty queue");
                }
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str) -> Event {
        Event::try_from(json!({ "id": id })).unwrap()
    }

    #[tokio::test]
    async fn test_put_on_full_queue_then_drain() {
        let (producer, mut consumer) = bounded(2, FullQueuePolicy::Drop);
        let timeout = Duration::from_millis(10);

        producer.put(event("1"), false, timeout).await.unwrap();
        producer.put(event("2"), false, timeout).await.unwrap();
        assert_eq!(
            producer.put(event("3"), false, timeout).await,
            Err(QueueError::Full)
        );
        assert_eq!(producer.depth(), 2);

        let batch = consumer.drain_batch(2, true, timeout, 1).await;
        assert_eq!(batch, vec![event("1"), event("2")]);

        producer.put(event("3"), false, timeout).await.unwrap();
        assert_eq!(consumer.get(false, timeout).await, Ok(event("3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_put_times_out() {
        let (producer, _consumer) = bounded(1, FullQueuePolicy::Block(Duration::from_secs(1)));

        producer.put(event("1"), true, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            producer.put(event("2"), true, Duration::from_secs(1)).await,
            Err(QueueError::Full)
        );
        assert_eq!(producer.offer(event("3")).await, Err(QueueError::Full));
    }

    #[tokio::test]
    async fn test_offer_on_closed_queue() {
        let (producer, consumer) = bounded(4, FullQueuePolicy::Drop);
        drop(consumer);

        assert_eq!(producer.offer(event("1")).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_zero_capacity_holds_one_event() {
        let (producer, consumer) = bounded(0, FullQueuePolicy::Drop);

        assert_eq!(producer.capacity(), 1);
        assert_eq!(consumer.capacity(), 1);
        assert_eq!(producer.offer(event("1")).await, Ok(()));
        assert_eq!(producer.offer(event("2")).await, Err(QueueError::Full));
    }

    #[tokio::test]
    async fn test_get_empty() {
        let (_producer, mut consumer) = bounded(4, FullQueuePolicy::Drop);

        assert_eq!(
            consumer.get(false, Duration::ZERO).await,
            Err(QueueError::Empty)
        );
        assert_eq!(
            consumer.get(true, Duration::from_millis(5)).await,
            Err(QueueError::Empty)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_batch_is_bounded_on_empty_queue() {
        let (_producer, mut consumer) = bounded(4, FullQueuePolicy::Drop);
        let timeout = Duration::from_millis(100);

        let started = tokio::time::Instant::now();
        let batch = consumer.drain_batch(10, true, timeout, 5).await;

        assert!(batch.is_empty());
        assert_eq!(started.elapsed(), timeout * 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_batch_without_producers_is_bounded() {
        let (producer, mut consumer) = bounded(4, FullQueuePolicy::Drop);
        producer.offer(event("1")).await.unwrap();
        drop(producer);

        let started = tokio::time::Instant::now();
        let batch = consumer.drain_batch(10, true, Duration::from_millis(100), 3).await;

        assert_eq!(batch, vec![event("1")]);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_drain_batch_stops_at_limit() {
        let (producer, mut consumer) = bounded(10, FullQueuePolicy::Drop);
        for id in ["1", "2", "3", "4"] {
            assert_eq!(producer.offer(event(id)).await, Ok(()));
        }

        let batch = consumer.drain_batch(3, false, Duration::ZERO, 1).await;
        assert_eq!(batch, vec![event("1"), event("2"), event("3")]);
        assert_eq!(producer.depth(), 1);
    }
}
