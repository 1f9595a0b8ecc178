//! Streaming and concurrency primitives shared across the runtime.
//!
//! Bounded stream channels with close semantics, cancellable tasks,
//! single-assignment promises, unbounded async queues, and the bounded
//! insertion-ordered cache used by the interruption detector.

pub mod cache;
pub mod chan;
pub mod promise;
pub mod queue;
pub mod task;

pub use cache::BoundedCache;
pub use chan::{DEFAULT_HIGH_WATER, StreamReader, StreamWriter, stream_channel};
pub use promise::Promise;
pub use queue::AsyncQueue;
pub use task::{TaskHandle, cancellable_sleep};
