//! Bounded drop-oldest queue
//!
//! Producers never wait: when the queue is full the oldest item is displaced
//! and counted. Used for per-session raw event ingestion and for engagement
//! report delivery, where freshness matters more than completeness.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer, single-consumer bounded queue with drop-oldest overflow
pub struct DropOldestQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item.
    ///
    /// Returns the displaced oldest item if the queue was full, or gives the
    /// item back if the queue is closed.
    pub fn push(&self, item: T) -> Result<Option<T>, T> {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(item);
            }
            let displaced = if inner.items.len() >= self.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            displaced
        };

        if displaced.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        Ok(displaced)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Wait for the next item. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            // A push between the check and here leaves a stored permit
            self.notify.notified().await;
        }
    }

    /// Refuse further pushes; queued items can still be drained
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Items displaced since creation
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = DropOldestQueue::new(3);
        for i in 0..3 {
            assert_eq!(queue.push(i), Ok(None));
        }
        assert_eq!(queue.push(3), Ok(Some(0)));
        assert_eq!(queue.push(4), Ok(Some(1)));
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), 3);

        let drained: Vec<i32> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn test_closed_rejects_push() {
        let queue = DropOldestQueue::new(2);
        queue.push(1).unwrap();
        queue.close();
        assert_eq!(queue.push(2), Err(2));
        assert_eq!(queue.try_pop(), Some(1));
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(DropOldestQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("hello").unwrap();
        assert_eq!(consumer.await.unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn test_pop_returns_none_after_close_and_drain() {
        let queue = Arc::new(DropOldestQueue::new(4));
        queue.push(7).unwrap();
        queue.close();
        assert_eq!(queue.pop().await, Some(7));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue: Arc<DropOldestQueue<u8>> = Arc::new(DropOldestQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }
}
