//! Best-effort real-time fan-out of decode lines to local subscribers.
//!
//! Every subscriber gets its own bounded queue; publishing never blocks and
//! never performs I/O. A slow subscriber loses lines, a broken one is removed
//! on its next failed delivery. The hub carries no history: durability is the
//! outbox's job.

pub mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

/// Handle for one registered subscriber.
///
/// Dropping the subscription closes its queue; the hub removes the entry
/// lazily on the next publish.
#[derive(Debug)]
pub struct Subscription {
    /// Identifier used to unsubscribe.
    pub id: u64,
    /// The subscriber's end of the delivery queue.
    pub receiver: mpsc::Receiver<String>,
}

/// Fan-out hub for rendered decode lines.
#[derive(Debug)]
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastHub {
    /// Create a hub whose subscribers each buffer up to `queue_capacity`
    /// lines.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<String>>> {
        // A poisoned registry still holds valid senders; keep going
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber and return its queue.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry().insert(id, tx);
        debug!("Subscriber {} registered", id);
        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber. Safe against concurrent publishes; unknown ids
    /// are ignored.
    pub fn unsubscribe(&self, id: u64) {
        if self.registry().remove(&id).is_some() {
            debug!("Subscriber {} removed", id);
        }
    }

    /// Enqueue a line to every subscriber without blocking.
    ///
    /// A subscriber with a full queue loses this line only; a subscriber
    /// whose receiver is gone is removed. Returns the number of subscribers
    /// the line was delivered to.
    pub fn publish(&self, line: &str) -> usize {
        let mut delivered = 0;
        self.registry().retain(|id, tx| {
            match tx.try_send(line.to_string()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow subscriber: drop the line for it, keep the others fast
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {} gone, removing", id);
                    false
                }
            }
        });
        delivered
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    /// Total lines dropped because a subscriber's queue was full.
    #[must_use]
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let hub = BroadcastHub::new(8);
        let mut sub = hub.subscribe();

        assert_eq!(hub.publish("134500 -12   0.3 1234 ~ CQ K1ABC FN42"), 1);
        let line = sub.receiver.recv().await.unwrap();
        assert!(line.contains("K1ABC"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = BroadcastHub::new(8);
        assert_eq!(hub.publish("anyone listening?"), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_delivery_order_per_subscriber() {
        let hub = BroadcastHub::new(8);
        let mut sub = hub.subscribe();

        hub.publish("one");
        hub.publish("two");
        hub.publish("three");

        assert_eq!(sub.receiver.recv().await.unwrap(), "one");
        assert_eq!(sub.receiver.recv().await.unwrap(), "two");
        assert_eq!(sub.receiver.recv().await.unwrap(), "three");
    }

    #[tokio::test]
    async fn test_saturated_subscriber_does_not_block_others() {
        let hub = std::sync::Arc::new(BroadcastHub::new(2));
        let _stalled = hub.subscribe(); // never reads
        let mut healthy = hub.subscribe();

        let drainer = tokio::spawn(async move {
            let mut lines = Vec::new();
            while lines.len() < 10 {
                match healthy.receiver.recv().await {
                    Some(line) => lines.push(line),
                    None => break,
                }
            }
            lines
        });

        for i in 0..10 {
            hub.publish(&format!("line {i}"));
            // Let the healthy drainer keep up while the stalled one ignores
            // its queue
            tokio::task::yield_now().await;
        }

        // The healthy subscriber got every line, in order, despite its
        // stalled peer
        let lines = drainer.await.unwrap();
        assert_eq!(lines.len(), 10);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line, &format!("line {i}"));
        }

        // The stalled subscriber kept its first two lines and lost the rest
        assert_eq!(hub.dropped_lines(), 8);
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_subscriber_removed_lazily() {
        let hub = BroadcastHub::new(8);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(sub);
        // Still registered until the next delivery attempt fails
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish("anyone?");
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = BroadcastHub::new(8);
        let sub1 = hub.subscribe();
        let _sub2 = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.unsubscribe(sub1.id);
        assert_eq!(hub.subscriber_count(), 1);

        // Unknown id is ignored
        hub.unsubscribe(9999);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_counts_deliveries() {
        let hub = BroadcastHub::new(8);
        let _a = hub.subscribe();
        let _b = hub.subscribe();

        assert_eq!(hub.publish("to both"), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_clamped() {
        let hub = BroadcastHub::new(0);
        let mut sub = hub.subscribe();
        hub.publish("still works");
        assert_eq!(sub.receiver.recv().await.unwrap(), "still works");
    }
}
