//! Unbounded async FIFO queue.
//!
//! Used where streaming input must never block the producer (provider
//! callbacks, event fan-in); backpressure is handled by outer rate limits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Result, VoxaError};

struct Inner<T> {
    items: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    buf: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO with async `next` and explicit close.
pub struct AsyncQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncQueue<T> {
    /// Create an empty open queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(QueueState {
                    buf: VecDeque::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue an item.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the queue was closed.
    pub fn put(&self, item: T) -> Result<()> {
        {
            let mut state = self.inner.items.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(VoxaError::Channel("put after close".into()));
            }
            state.buf.push_back(item);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Close the queue. Pending items remain readable; `next` yields `None`
    /// once drained.
    pub fn close(&self) {
        {
            let mut state = self.inner.items.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        self.inner.notify.notify_waiters();
    }

    /// Dequeue the next item, waiting while the queue is open and empty.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.items.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(item) = state.buf.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.inner
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .buf
            .len()
    }

    /// Whether no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let q = AsyncQueue::new();
        q.put(1).unwrap();
        q.put(2).unwrap();
        q.put(3).unwrap();
        assert_eq!(q.next().await, Some(1));
        assert_eq!(q.next().await, Some(2));
        assert_eq!(q.next().await, Some(3));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = AsyncQueue::new();
        q.put("a").unwrap();
        q.close();
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, None);
        assert!(q.put("b").is_err());
    }

    #[tokio::test]
    async fn next_waits_for_put() {
        let q = AsyncQueue::new();
        let q2 = q.clone();
        let reader = tokio::spawn(async move { q2.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        q.put(42u32).unwrap();
        assert_eq!(reader.await.unwrap(), Some(42));
    }
}
