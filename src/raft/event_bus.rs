//! Event Bus
//!
//! Broadcasts committed entries and role changes to any number of subscribers.

use tokio::sync::broadcast;

/// Broadcast channel wrapper
///
/// Slow subscribers lag and lose the oldest events; they observe a
/// `RecvError::Lagged` and can re-read from the log.
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of subscribers that received the event
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn publish_batch(&self, events: Vec<E>) -> usize {
        events.into_iter().map(|event| self.publish(event)).sum()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.publish(1u64), 2);
        assert_eq!(first.recv().await.unwrap(), 1);
        assert_eq!(second.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_new_events() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(1u64), 0);

        let mut rx = bus.subscribe();
        assert_eq!(bus.publish_batch(vec![2, 3]), 2);
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), 3);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
