//! Speech handles: one in-flight agent utterance.
//!
//! A handle is created when a reply is requested, scheduled behind any
//! active handle, authorized once its gates release, and then drives the
//! LLM → TTS → audio pipeline (see [`pipeline`]). States advance
//! monotonically and terminal states are sticky. Parent/child linkage lets
//! an interruption cancel a whole tool-call chain atomically.

pub mod pipeline;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::ChatItem;
use crate::error::{Result, VoxaError};
use crate::sync::promise::Promise;

/// Why a handle reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// Played to completion.
    Completed,
    /// The user interrupted playback.
    Interrupted,
    /// A preemptive generation was discarded (transcript mismatch).
    Preempted,
    /// A provider error ended the handle.
    Failed,
    /// Cancelled before speaking.
    Cancelled,
}

/// Lifecycle state of a speech handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    /// Just created.
    Created,
    /// Enqueued behind the active handle.
    Scheduled,
    /// All gates released; may produce audio.
    Authorized,
    /// LLM/TTS pipeline running.
    Generating,
    /// Audio flowing to the room.
    Playing,
    /// Terminal.
    Done(DoneReason),
}

impl SpeechState {
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Scheduled => 1,
            Self::Authorized => 2,
            Self::Generating => 3,
            Self::Playing => 4,
            Self::Done(_) => 5,
        }
    }
}

/// A named precondition on audio output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    /// The predecessor handle finished playback.
    ParentDone,
    /// The preflight transcript was confirmed by the committed turn.
    Preflight,
    /// Held by external code until it explicitly authorizes.
    Explicit,
}

struct HandleInner {
    id: String,
    allow_interruptions: AtomicBool,
    step_index: AtomicUsize,
    state: Mutex<SpeechState>,
    gates: Mutex<HashSet<Gate>>,
    gates_notify: Notify,
    cancel: CancellationToken,
    terminal_hint: Mutex<Option<DoneReason>>,
    chat_items: Mutex<Vec<ChatItem>>,
    children: Mutex<Vec<SpeechHandle>>,
    done: Promise<DoneReason>,
    scheduled_at: Instant,
}

/// Handle to one agent utterance. Cheap to clone; all clones observe the
/// same state.
#[derive(Clone)]
pub struct SpeechHandle {
    inner: Arc<HandleInner>,
}

impl SpeechHandle {
    /// Create a handle holding the given gates.
    pub fn new(allow_interruptions: bool, gates: &[Gate]) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: format!("speech_{}", Uuid::new_v4().simple()),
                allow_interruptions: AtomicBool::new(allow_interruptions),
                step_index: AtomicUsize::new(0),
                state: Mutex::new(SpeechState::Created),
                gates: Mutex::new(gates.iter().copied().collect()),
                gates_notify: Notify::new(),
                cancel: CancellationToken::new(),
                terminal_hint: Mutex::new(None),
                chat_items: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                done: Promise::new(),
                scheduled_at: Instant::now(),
            }),
        }
    }

    /// The handle's unique id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// When the handle entered the queue.
    pub fn scheduled_at(&self) -> Instant {
        self.inner.scheduled_at
    }

    /// Whether the user may interrupt this utterance.
    pub fn allow_interruptions(&self) -> bool {
        self.inner.allow_interruptions.load(Ordering::SeqCst)
    }

    /// Current tool-loop step.
    pub fn step_index(&self) -> usize {
        self.inner.step_index.load(Ordering::SeqCst)
    }

    /// Advance the tool-loop step counter.
    pub fn bump_step(&self) -> usize {
        self.inner.step_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SpeechState {
        *lock(&self.inner.state)
    }

    /// Advance to `state`. Transitions are monotonic; terminal states are
    /// sticky, so regressions and post-terminal updates are ignored.
    pub fn mark(&self, state: SpeechState) {
        let mut current = lock(&self.inner.state);
        if matches!(*current, SpeechState::Done(_)) || state.rank() <= current.rank() {
            return;
        }
        *current = state;
        drop(current);
        if let SpeechState::Done(reason) = state {
            self.inner.done.resolve(reason);
            // Unblock anything waiting on authorization during cleanup.
            lock(&self.inner.gates).clear();
            self.inner.gates_notify.notify_waiters();
            self.inner.cancel.cancel();
        }
    }

    /// Release one gate. Audio may flow once all gates are released.
    pub fn release_gate(&self, gate: Gate) {
        let mut gates = lock(&self.inner.gates);
        if gates.remove(&gate) && gates.is_empty() {
            drop(gates);
            self.inner.gates_notify.notify_waiters();
        }
    }

    /// Remaining gates.
    pub fn pending_gates(&self) -> Vec<Gate> {
        lock(&self.inner.gates).iter().copied().collect()
    }

    /// Wait until every gate is released.
    ///
    /// # Errors
    ///
    /// Returns [`VoxaError::Aborted`] if the handle is cancelled first.
    pub async fn wait_authorized(&self) -> Result<()> {
        loop {
            let notified = self.inner.gates_notify.notified();
            if self.inner.cancel.is_cancelled() {
                return Err(VoxaError::Aborted);
            }
            if lock(&self.inner.gates).is_empty() {
                return Ok(());
            }
            tokio::select! {
                () = self.inner.cancel.cancelled() => return Err(VoxaError::Aborted),
                () = notified => {}
            }
        }
    }

    /// Request interruption of this utterance and its whole chain.
    pub fn interrupt(&self) {
        self.cancel_chain(DoneReason::Interrupted);
    }

    /// Cancel the handle (and chain) with an explicit terminal reason.
    pub fn cancel_chain(&self, reason: DoneReason) {
        {
            let mut hint = lock(&self.inner.terminal_hint);
            hint.get_or_insert(reason);
        }
        self.inner.cancel.cancel();
        self.inner.gates_notify.notify_waiters();
        for child in lock(&self.inner.children).iter() {
            child.cancel_chain(reason);
        }
    }

    /// The reason recorded when cancellation was requested.
    pub fn terminal_hint(&self) -> DoneReason {
        lock(&self.inner.terminal_hint).unwrap_or(DoneReason::Cancelled)
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token observed by the pipeline's suspension points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Record a chat item produced by this utterance.
    pub fn add_chat_item(&self, item: ChatItem) {
        lock(&self.inner.chat_items).push(item);
    }

    /// Items produced so far.
    pub fn chat_items(&self) -> Vec<ChatItem> {
        lock(&self.inner.chat_items).clone()
    }

    /// Link a chained handle (tool-loop continuation or handoff reply).
    pub fn add_child(&self, child: &SpeechHandle) {
        lock(&self.inner.children).push(child.clone());
    }

    /// Await the terminal state.
    pub async fn wait_done(&self) -> DoneReason {
        self.inner.done.wait().await
    }

    /// Terminal reason, if already reached.
    pub fn done_reason(&self) -> Option<DoneReason> {
        self.inner.done.peek()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_monotonic_and_sticky() {
        let handle = SpeechHandle::new(true, &[]);
        handle.mark(SpeechState::Scheduled);
        handle.mark(SpeechState::Playing);
        // Regression ignored.
        handle.mark(SpeechState::Generating);
        assert_eq!(handle.state(), SpeechState::Playing);

        handle.mark(SpeechState::Done(DoneReason::Completed));
        handle.mark(SpeechState::Playing);
        assert_eq!(
            handle.state(),
            SpeechState::Done(DoneReason::Completed),
            "terminal states are sticky"
        );
    }

    #[tokio::test]
    async fn authorization_waits_for_all_gates() {
        let handle = SpeechHandle::new(true, &[Gate::ParentDone, Gate::Preflight]);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_authorized().await })
        };
        handle.release_gate(Gate::ParentDone);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "one gate still held");
        handle.release_gate(Gate::Preflight);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_authorization() {
        let handle = SpeechHandle::new(true, &[Gate::Explicit]);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_authorized().await })
        };
        handle.cancel_chain(DoneReason::Cancelled);
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(VoxaError::Aborted)));
    }

    #[tokio::test]
    async fn interrupt_cancels_children() {
        let parent = SpeechHandle::new(true, &[]);
        let child = SpeechHandle::new(true, &[Gate::ParentDone]);
        parent.add_child(&child);
        parent.interrupt();
        assert!(child.is_cancelled());
        assert_eq!(child.terminal_hint(), DoneReason::Interrupted);
    }

    #[tokio::test]
    async fn done_resolves_waiters() {
        let handle = SpeechHandle::new(true, &[]);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_done().await })
        };
        handle.mark(SpeechState::Done(DoneReason::Completed));
        assert_eq!(waiter.await.unwrap(), DoneReason::Completed);
        assert_eq!(handle.done_reason(), Some(DoneReason::Completed));
    }

    #[test]
    fn step_index_advances() {
        let handle = SpeechHandle::new(true, &[]);
        assert_eq!(handle.step_index(), 0);
        assert_eq!(handle.bump_step(), 1);
        assert_eq!(handle.step_index(), 1);
    }
}
