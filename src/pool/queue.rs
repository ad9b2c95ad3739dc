//! Bounded event queue with a pluggable overflow strategy

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What a full queue does with a new event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Shed the oldest queued event to make room
    #[default]
    DropOldest,
    /// Shed the incoming event
    DropNewest,
    /// Wait for the consumer to make room
    Block,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
            Self::Block => "block",
        }
    }
}

/// Result of [`EventQueue::push`]
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Queued,
    /// The event shed to honor the capacity
    Dropped(T),
}

/// FIFO queue bounded to a fixed capacity
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    available: Notify,
    space: Notify,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an event, applying the overflow policy when full
    pub async fn push(&self, item: T) -> PushOutcome<T> {
        loop {
            {
                let mut items = self.lock();
                if items.len() < self.capacity {
                    items.push_back(item);
                    drop(items);
                    self.available.notify_one();
                    return PushOutcome::Queued;
                }

                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let oldest = items.pop_front();
                        items.push_back(item);
                        drop(items);
                        self.available.notify_one();
                        return oldest.map_or(PushOutcome::Queued, PushOutcome::Dropped);
                    }
                    OverflowPolicy::DropNewest => return PushOutcome::Dropped(item),
                    OverflowPolicy::Block => {}
                }
            }
            self.space.notified().await;
        }
    }

    /// Dequeue the next event, waiting until one is available
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.lock().pop_front() {
                self.space.notify_one();
                return item;
            }
            self.available.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new(4, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(queue.push(i).await, PushOutcome::Queued);
        }
        assert_eq!(queue.pop().await, 0);
        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test]
    async fn test_drop_oldest() {
        let queue = EventQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(1).await;
        queue.push(2).await;
        assert_eq!(queue.push(3).await, PushOutcome::Dropped(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await, 2);
        assert_eq!(queue.pop().await, 3);
    }

    #[tokio::test]
    async fn test_drop_newest() {
        let queue = EventQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(1).await;
        queue.push(2).await;
        assert_eq!(queue.push(3).await, PushOutcome::Dropped(3));
        assert_eq!(queue.pop().await, 1);
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let queue = Arc::new(EventQueue::new(1, OverflowPolicy::Block));
        queue.push(1).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await, 1);
        assert_eq!(producer.await.unwrap(), PushOutcome::Queued);
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test]
    async fn test_pop_waits_for_item() {
        let queue = Arc::new(EventQueue::new(1, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(7).await;
        assert_eq!(consumer.await.unwrap(), 7);
    }

    #[test]
    fn test_policy_serde() {
        let policy: OverflowPolicy = serde_json::from_str("\"drop_newest\"").unwrap();
        assert_eq!(policy, OverflowPolicy::DropNewest);
        assert_eq!(OverflowPolicy::default().as_str(), "drop_oldest");
    }
}
