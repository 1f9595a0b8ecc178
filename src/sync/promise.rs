//! Single-assignment promise.
//!
//! `resolve` is idempotent (the first value wins) and `wait` may be called
//! any number of times, always yielding a clone of the same result. Used for
//! one-shot signals that multiple tasks await: playback start, handle
//! completion, authorization release.

use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

struct Inner<T> {
    value: OnceLock<T>,
    notify: Notify,
}

/// A single-assignment, multi-await future value.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Promise<T> {
    /// Create an unresolved promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the promise. Returns `false` if it was already resolved
    /// (the original value is kept).
    pub fn resolve(&self, value: T) -> bool {
        let fresh = self.inner.value.set(value).is_ok();
        if fresh {
            self.inner.notify.notify_waiters();
        }
        fresh
    }

    /// The resolved value, if any.
    pub fn peek(&self) -> Option<T> {
        self.inner.value.get().cloned()
    }

    /// Whether the promise has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Await resolution. Safe to call repeatedly and from multiple tasks.
    pub async fn wait(&self) -> T {
        loop {
            // Register interest before checking to avoid a missed wakeup.
            let notified = self.inner.notify.notified();
            if let Some(value) = self.inner.value.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_then_wait() {
        let p = Promise::new();
        assert!(p.resolve(7));
        assert_eq!(p.wait().await, 7);
        assert_eq!(p.wait().await, 7);
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let p = Promise::new();
        assert!(p.resolve("first"));
        assert!(!p.resolve("second"));
        assert_eq!(p.wait().await, "first");
    }

    #[tokio::test]
    async fn waiters_wake_on_resolve() {
        let p = Promise::new();
        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        p.resolve(99u32);
        assert_eq!(waiter.await.unwrap(), 99);
    }

    #[test]
    fn peek_before_resolution() {
        let p: Promise<u8> = Promise::new();
        assert!(p.peek().is_none());
        assert!(!p.is_resolved());
    }
}
