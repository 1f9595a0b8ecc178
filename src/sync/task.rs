//! Cancellable cooperative tasks.
//!
//! A [`TaskHandle`] wraps a spawned tokio task together with its
//! `CancellationToken`. The task body receives the token and is expected to
//! select on it at suspension points; cancellation surfaces inside the body
//! as [`VoxaError::Aborted`] when using [`cancellable_sleep`] or
//! [`abortable`]. Drop-based cleanup still runs on the cooperative exit
//! path.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VoxaError};

/// A cooperatively cancellable unit of work.
pub struct TaskHandle<T> {
    cancel: CancellationToken,
    join: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn a task whose body receives a cancellation token.
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(body(cancel.clone()));
        Self { cancel, join }
    }

    /// Spawn a task tied to an existing token (child scope).
    pub fn spawn_with_token<F, Fut>(cancel: CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let join = tokio::spawn(body(cancel.clone()));
        Self { cancel, join }
    }

    /// Request cancellation without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Request cancellation and await task termination.
    ///
    /// Returns the task's output unless it panicked.
    pub async fn cancel_and_wait(self) -> Option<T> {
        self.cancel.cancel();
        self.join.await.ok()
    }

    /// Await the task's completion.
    pub async fn join(self) -> Option<T> {
        self.join.await.ok()
    }

    /// Whether the task has finished (completed, cancelled, or panicked).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// The task's cancellation token, for wiring child scopes.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Sleep for `duration`, aborting early when `cancel` fires.
///
/// # Errors
///
/// Returns [`VoxaError::Aborted`] if cancelled before the sleep completes.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(VoxaError::Aborted),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run a future, aborting it when `cancel` fires.
///
/// # Errors
///
/// Returns [`VoxaError::Aborted`] if cancelled before `fut` resolves.
pub async fn abortable<T>(
    fut: impl Future<Output = T>,
    cancel: &CancellationToken,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(VoxaError::Aborted),
        out = fut => Ok(out),
    }
}
