//! Bounded stream channels with explicit close semantics.
//!
//! A `StreamChannel` is the wire between pipeline stages: a single producer
//! writes items (suspending when the bounded buffer is full, which is how
//! backpressure propagates upward from a slow consumer), closes exactly
//! once, and a single consumer drains it. `pipe_through` and `tee` spawn
//! small forwarding tasks, mirroring how the pipeline coordinator composes
//! stages.

use tokio::sync::mpsc;

use crate::error::{Result, VoxaError};

/// Default bounded-buffer size between pipeline stages.
pub const DEFAULT_HIGH_WATER: usize = 32;

/// Create a stream channel with the default high-water mark.
pub fn stream_channel<T: Send + 'static>() -> (StreamWriter<T>, StreamReader<T>) {
    stream_channel_with_capacity(DEFAULT_HIGH_WATER)
}

/// Create a stream channel with an explicit buffer capacity.
pub fn stream_channel_with_capacity<T: Send + 'static>(
    capacity: usize,
) -> (StreamWriter<T>, StreamReader<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamWriter { tx: Some(tx) }, StreamReader { rx })
}

/// Producer half of a stream channel.
pub struct StreamWriter<T> {
    tx: Option<mpsc::Sender<T>>,
}

impl<T: Send + 'static> StreamWriter<T> {
    /// Write an item, suspending while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the writer was closed or the reader is gone.
    pub async fn write(&mut self, item: T) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(VoxaError::Channel("write after close".into()));
        };
        tx.send(item)
            .await
            .map_err(|_| VoxaError::Channel("reader dropped".into()))
    }

    /// Attempt a non-blocking write, dropping the item if the buffer is full.
    ///
    /// Returns `true` if the item was enqueued.
    pub fn try_write(&mut self, item: T) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(item).is_ok(),
            None => false,
        }
    }

    /// Close the channel. Subsequent writes fail; the reader drains the
    /// buffer and then observes end-of-stream.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Consumer half of a stream channel.
pub struct StreamReader<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Send + 'static> StreamReader<T> {
    /// Receive the next item, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Compose a synchronous transform stage onto this reader.
    ///
    /// Spawns a task that applies `transform` to each item, forwarding
    /// `Some` results. Backpressure propagates: the task suspends when the
    /// downstream buffer is full, which in turn slows this channel's writer.
    pub fn pipe_through<U, F>(mut self, mut transform: F) -> StreamReader<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        let (mut tx, rx) = stream_channel();
        tokio::spawn(async move {
            while let Some(item) = self.recv().await {
                if let Some(mapped) = transform(item) {
                    if tx.write(mapped).await.is_err() {
                        break;
                    }
                }
            }
            tx.close();
        });
        rx
    }

    /// Fan this stream out to two readers.
    ///
    /// Each item is cloned into both branches. A slow branch exerts
    /// backpressure on the other; use generous capacities for side taps.
    pub fn tee(mut self) -> (StreamReader<T>, StreamReader<T>)
    where
        T: Clone,
    {
        let (mut tx_a, rx_a) = stream_channel();
        let (mut tx_b, rx_b) = stream_channel();
        tokio::spawn(async move {
            while let Some(item) = self.recv().await {
                let a_ok = tx_a.write(item.clone()).await.is_ok();
                let b_ok = tx_b.write(item).await.is_ok();
                if !a_ok && !b_ok {
                    break;
                }
            }
            tx_a.close();
            tx_b.close();
        });
        (rx_a, rx_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let (mut tx, mut rx) = stream_channel();
        tx.write(1u32).await.unwrap();
        tx.write(2).await.unwrap();
        tx.close();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn write_after_close_rejected() {
        let (mut tx, _rx) = stream_channel::<u32>();
        tx.close();
        assert!(tx.write(1).await.is_err());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn write_suspends_when_full() {
        let (mut tx, mut rx) = stream_channel_with_capacity(1);
        tx.write(1u32).await.unwrap();

        // Second write must block until the reader makes room.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            tx.write(2),
        )
        .await;
        assert!(pending.is_err(), "write should suspend on a full buffer");

        assert_eq!(rx.recv().await, Some(1));
        tx.write(2).await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn pipe_through_transforms_and_filters() {
        let (mut tx, rx) = stream_channel();
        let mut doubled = rx.pipe_through(|n: u32| if n % 2 == 0 { Some(n * 10) } else { None });
        for n in 1..=4 {
            tx.write(n).await.unwrap();
        }
        tx.close();
        assert_eq!(doubled.recv().await, Some(20));
        assert_eq!(doubled.recv().await, Some(40));
        assert_eq!(doubled.recv().await, None);
    }

    #[tokio::test]
    async fn tee_duplicates_items() {
        let (mut tx, rx) = stream_channel();
        let (mut a, mut b) = rx.tee();
        tx.write("x".to_string()).await.unwrap();
        tx.close();
        assert_eq!(a.recv().await.as_deref(), Some("x"));
        assert_eq!(b.recv().await.as_deref(), Some("x"));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
    }
}
