//! Transcription synchronizer.
//!
//! The LLM emits text far faster than the TTS speaks it; forwarding raw
//! tokens would make captions race ahead of the voice. This module paces
//! forwarded text to the audio timeline using a hyphen-count speech-rate
//! model, one segment per (text, audio) pair, rotating segments across
//! utterances and flushing or truncating on playback completion and
//! interruption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::sync::promise::Promise;
use crate::sync::queue::AsyncQueue;
use crate::sync::task::TaskHandle;
use crate::text::{hyphen_count, split_sentences};

/// Standard speech rate in hyphens (syllables) per second.
pub const STANDARD_SPEECH_RATE: f64 = 3.83;

/// One paced text update for the room's transcription channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionUpdate {
    /// Segment this delta belongs to.
    pub segment_id: String,
    /// Newly forwarded text (empty on the closing update).
    pub delta: String,
    /// Whether the segment is complete.
    pub is_final: bool,
}

/// Outcome of playback for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaybackOutcome {
    interrupted: bool,
}

struct SegmentShared {
    segment_id: String,
    /// Everything pushed into the segment, in order.
    pushed_text: Mutex<String>,
    /// Everything forwarded so far.
    forwarded_text: Mutex<String>,
    /// Resolved by the first audio frame.
    start_wall: Promise<Instant>,
    pushed_audio: Mutex<Duration>,
    playback: Promise<PlaybackOutcome>,
    /// Resolved with the synchronized transcript when the segment closes.
    done: Promise<String>,
}

/// Synchronizes one (text, audio) segment.
pub struct SegmentSynchronizer {
    shared: Arc<SegmentShared>,
    sentences: AsyncQueue<String>,
    pending: Mutex<String>,
    text_closed: AtomicBool,
    out: mpsc::UnboundedSender<TranscriptionUpdate>,
    task: TaskHandle<()>,
}

impl SegmentSynchronizer {
    /// Start a segment pacing task writing updates to `out`.
    pub fn new(speed_multiplier: f64, out: mpsc::UnboundedSender<TranscriptionUpdate>) -> Self {
        let shared = Arc::new(SegmentShared {
            segment_id: format!("seg_{}", Uuid::new_v4().simple()),
            pushed_text: Mutex::new(String::new()),
            forwarded_text: Mutex::new(String::new()),
            start_wall: Promise::new(),
            pushed_audio: Mutex::new(Duration::ZERO),
            playback: Promise::new(),
            done: Promise::new(),
        });
        let sentences = AsyncQueue::new();
        let speed = (speed_multiplier.max(0.1)) * STANDARD_SPEECH_RATE;
        let task = TaskHandle::spawn({
            let shared = Arc::clone(&shared);
            let sentences = sentences.clone();
            let out = out.clone();
            move |cancel| async move {
                run_pacer(shared, sentences, speed, out, cancel).await;
            }
        });
        Self {
            shared,
            sentences,
            pending: Mutex::new(String::new()),
            text_closed: AtomicBool::new(false),
            out,
            task,
        }
    }

    /// The segment's id.
    pub fn segment_id(&self) -> &str {
        &self.shared.segment_id
    }

    /// Push LLM text; complete sentences are queued for pacing.
    pub fn push_text(&self, text: &str) {
        if self.text_closed.load(Ordering::SeqCst) {
            warn!("push_text on a closed segment ignored");
            return;
        }
        lock(&self.shared.pushed_text).push_str(text);
        let mut pending = lock(&self.pending);
        pending.push_str(text);
        let sentences = split_sentences(&pending);
        if sentences.len() > 1 || ends_sentence(&pending) {
            let complete = if ends_sentence(&pending) {
                sentences.len()
            } else {
                sentences.len() - 1
            };
            let mut rest = String::new();
            for (i, sentence) in sentences.into_iter().enumerate() {
                if i < complete {
                    let _ = self.sentences.put(sentence);
                } else {
                    rest = sentence;
                }
            }
            *pending = rest;
        }
    }

    /// No more text will be pushed; the remainder is queued as-is.
    pub fn end_text_input(&self) {
        if self.text_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let rest = std::mem::take(&mut *lock(&self.pending));
        if !rest.trim().is_empty() {
            let _ = self.sentences.put(rest.trim().to_string());
        }
        self.sentences.close();
    }

    /// Account for synthesized audio; the first call starts the clock.
    pub fn push_audio(&self, duration: Duration) {
        *lock(&self.shared.pushed_audio) += duration;
        self.shared.start_wall.resolve(Instant::now());
    }

    /// Forward provider-aligned text immediately, bypassing pacing.
    ///
    /// Used when the TTS exposes per-chunk timings: the text already
    /// arrives at the moment its audio does, so no speech-rate model is
    /// needed. Aligned text never enters the pacing queue.
    pub fn push_aligned(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        lock(&self.shared.pushed_text).push_str(text);
        lock(&self.shared.forwarded_text).push_str(text);
        let _ = self.out.send(TranscriptionUpdate {
            segment_id: self.shared.segment_id.clone(),
            delta: text.to_string(),
            is_final: false,
        });
    }

    /// Total audio pushed into this segment.
    pub fn pushed_duration(&self) -> Duration {
        *lock(&self.shared.pushed_audio)
    }

    /// Report playback completion or interruption.
    ///
    /// On normal completion the remaining text is flushed unpaced; on
    /// interruption forwarding stops where it is.
    pub fn mark_playback_finished(&self, interrupted: bool) {
        self.end_text_input();
        self.shared.playback.resolve(PlaybackOutcome { interrupted });
    }

    /// The forwarded text on interruption, or the full pushed text on
    /// completion. Resolves when the segment closes.
    pub async fn synchronized_transcript(&self) -> String {
        self.shared.done.wait().await
    }

    /// Wait for the pacing task to finish.
    pub async fn wait_done(self) {
        let _ = self.task.join().await;
    }

    /// Abort pacing immediately (rotation of an abandoned segment).
    pub async fn abort(self) {
        self.sentences.close();
        let _ = self.task.cancel_and_wait().await;
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn ends_sentence(text: &str) -> bool {
    text.trim_end().ends_with(['.', '!', '?'])
}

async fn run_pacer(
    shared: Arc<SegmentShared>,
    sentences: AsyncQueue<String>,
    speed: f64,
    out: mpsc::UnboundedSender<TranscriptionUpdate>,
    cancel: tokio_util::sync::CancellationToken,
) {
    // No pacing until audio actually starts playing.
    let start_wall = tokio::select! {
        () = cancel.cancelled() => {
            finish(&shared, &out);
            return;
        }
        start = shared.start_wall.wait() => start,
        outcome = shared.playback.wait() => {
            // Playback ended before any audio: flush (completed) or drop
            // (interrupted) whatever text exists.
            if !outcome.interrupted {
                flush_all(&shared, &sentences, &out).await;
            }
            finish(&shared, &out);
            return;
        }
    };

    let mut forwarded_hyphens = 0.0_f64;
    'segment: while let Some(sentence) = tokio::select! {
        () = cancel.cancelled() => None,
        s = sentences.next() => s,
    } {
        for word in split_words(&sentence) {
            if let Some(outcome) = shared.playback.peek() {
                if outcome.interrupted {
                    break 'segment;
                }
                // Playback already completed: no pacing for the rest.
                emit(&shared, &out, &word);
                continue;
            }
            let h_w = f64::from(hyphen_count(word.trim()) as u32);
            let elapsed = start_wall.elapsed().as_secs_f64();
            let target = elapsed * speed;
            let behind = (target - forwarded_hyphens).max(0.0);
            let delay = ((h_w - behind).max(0.0) / speed).max(0.0);
            let half = Duration::from_secs_f64(delay / 2.0);

            // A playback resolution mid-sleep wakes us early; re-check it.
            let _ = sleep_or_playback(&shared, half, &cancel).await;
            if shared.playback.peek().is_some_and(|o| o.interrupted) {
                break 'segment;
            }
            emit(&shared, &out, &word);
            forwarded_hyphens += h_w;
            let _ = sleep_or_playback(&shared, half, &cancel).await;
        }
    }

    if shared.playback.peek().is_none_or(|o| !o.interrupted) {
        flush_all(&shared, &sentences, &out).await;
    }
    finish(&shared, &out);
}

/// Sleep for `dur`, waking early if playback resolves. Returns `true` on an
/// early wake.
async fn sleep_or_playback(
    shared: &Arc<SegmentShared>,
    dur: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> bool {
    if dur.is_zero() {
        return false;
    }
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(dur) => false,
        _ = shared.playback.wait() => true,
    }
}

fn emit(shared: &Arc<SegmentShared>, out: &mpsc::UnboundedSender<TranscriptionUpdate>, word: &str) {
    lock(&shared.forwarded_text).push_str(word);
    let _ = out.send(TranscriptionUpdate {
        segment_id: shared.segment_id.clone(),
        delta: word.to_string(),
        is_final: false,
    });
}

async fn flush_all(
    shared: &Arc<SegmentShared>,
    sentences: &AsyncQueue<String>,
    out: &mpsc::UnboundedSender<TranscriptionUpdate>,
) {
    // Emit whatever is still queued, joined the way it was pushed.
    while let Some(sentence) = if sentences.is_empty() {
        None
    } else {
        sentences.next().await
    } {
        for word in split_words(&sentence) {
            emit(shared, out, &word);
        }
    }
}

fn finish(shared: &Arc<SegmentShared>, out: &mpsc::UnboundedSender<TranscriptionUpdate>) {
    let interrupted = shared.playback.peek().is_some_and(|o| o.interrupted);
    let transcript = if interrupted {
        lock(&shared.forwarded_text).trim_end().to_string()
    } else {
        lock(&shared.pushed_text).clone()
    };
    let _ = out.send(TranscriptionUpdate {
        segment_id: shared.segment_id.clone(),
        delta: String::new(),
        is_final: true,
    });
    shared.done.resolve(transcript);
}

/// Split a sentence into word spans, each keeping one trailing space.
fn split_words(sentence: &str) -> Vec<String> {
    let mut words: Vec<String> = sentence
        .split_whitespace()
        .map(|w| format!("{w} "))
        .collect();
    if let Some(last) = words.last_mut() {
        *last = last.trim_end().to_string();
        last.push(' ');
    }
    words
}

/// Rotates [`SegmentSynchronizer`]s across utterances and exposes the
/// merged update stream.
pub struct TranscriptSynchronizer {
    out_tx: mpsc::UnboundedSender<TranscriptionUpdate>,
    speed_multiplier: f64,
    current: tokio::sync::Mutex<Option<SegmentSynchronizer>>,
    rotation: tokio::sync::Mutex<()>,
}

impl TranscriptSynchronizer {
    /// Create a synchronizer and its update stream.
    pub fn new(speed_multiplier: f64) -> (Self, mpsc::UnboundedReceiver<TranscriptionUpdate>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                out_tx,
                speed_multiplier,
                current: tokio::sync::Mutex::new(None),
                rotation: tokio::sync::Mutex::new(()),
            },
            out_rx,
        )
    }

    /// Push text into the current segment, creating one if needed.
    pub async fn push_text(&self, text: &str) {
        let mut current = self.current.lock().await;
        current
            .get_or_insert_with(|| {
                SegmentSynchronizer::new(self.speed_multiplier, self.out_tx.clone())
            })
            .push_text(text);
    }

    /// Account for synthesized audio in the current segment.
    pub async fn push_audio(&self, duration: Duration) {
        let mut current = self.current.lock().await;
        current
            .get_or_insert_with(|| {
                SegmentSynchronizer::new(self.speed_multiplier, self.out_tx.clone())
            })
            .push_audio(duration);
    }

    /// Forward provider-aligned text for the current segment, unpaced.
    pub async fn push_aligned_text(&self, text: &str) {
        let mut current = self.current.lock().await;
        current
            .get_or_insert_with(|| {
                SegmentSynchronizer::new(self.speed_multiplier, self.out_tx.clone())
            })
            .push_aligned(text);
    }

    /// Signal that the current segment's text input is complete.
    pub async fn end_text_input(&self) {
        if let Some(segment) = self.current.lock().await.as_ref() {
            segment.end_text_input();
        }
    }

    /// Report playback completion for the current segment and return its
    /// synchronized transcript.
    pub async fn mark_playback_finished(&self, interrupted: bool) -> String {
        let segment = self.current.lock().await.take();
        match segment {
            Some(segment) => {
                segment.mark_playback_finished(interrupted);
                let transcript = segment.synchronized_transcript().await;
                segment.wait_done().await;
                transcript
            }
            None => String::new(),
        }
    }

    /// Close the current segment (if any) and prepare for the next
    /// utterance. Rotations are serialized; concurrent calls warn and wait.
    pub async fn rotate_segment(&self) {
        let guard = match self.rotation.try_lock() {
            Ok(g) => g,
            Err(_) => {
                warn!("segment rotation already in progress");
                self.rotation.lock().await
            }
        };
        let segment = self.current.lock().await.take();
        if let Some(segment) = segment {
            // Audio ended (or never arrived) before the text did: flush the
            // segment as completed so no text is lost.
            segment.mark_playback_finished(false);
            segment.wait_done().await;
        }
        drop(guard);
    }

    /// Abort any in-flight segment without flushing.
    pub async fn close(&self) {
        let segment = self.current.lock().await.take();
        if let Some(segment) = segment {
            segment.abort().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain_until_final(
        rx: &mut mpsc::UnboundedReceiver<TranscriptionUpdate>,
    ) -> Vec<TranscriptionUpdate> {
        let mut updates = Vec::new();
        while let Ok(Some(u)) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            let done = u.is_final;
            updates.push(u);
            if done {
                break;
            }
        }
        updates
    }

    fn forwarded(updates: &[TranscriptionUpdate]) -> String {
        updates.iter().map(|u| u.delta.as_str()).collect()
    }

    #[tokio::test]
    async fn completed_playback_forwards_all_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let segment = SegmentSynchronizer::new(1.0, tx);
        segment.push_text("Sure. I can help with that.");
        segment.push_audio(Duration::from_millis(1_500));
        segment.mark_playback_finished(false);

        let transcript = segment.synchronized_transcript().await;
        assert_eq!(transcript, "Sure. I can help with that.");
        let updates = drain_until_final(&mut rx).await;
        assert!(updates.last().unwrap().is_final);
        assert_eq!(
            forwarded(&updates).trim_end(),
            "Sure. I can help with that."
        );
        segment.wait_done().await;
    }

    #[tokio::test]
    async fn forwarded_text_is_prefix_of_pushed_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Slow speech rate so pacing is observable.
        let segment = SegmentSynchronizer::new(0.4, tx);
        segment.push_text("one two three four five six seven eight.");
        segment.push_audio(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut partial = String::new();
        while let Ok(u) = rx.try_recv() {
            partial.push_str(&u.delta);
        }
        assert!(
            "one two three four five six seven eight."
                .starts_with(partial.trim_end()),
            "forwarded text must be a prefix, got {partial:?}"
        );

        segment.mark_playback_finished(false);
        segment.wait_done().await;
    }

    #[tokio::test]
    async fn interruption_stops_forwarding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let segment = SegmentSynchronizer::new(0.3, tx);
        segment.push_text("this is a long sentence that will be cut off early.");
        segment.push_audio(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(120)).await;
        segment.mark_playback_finished(true);

        let transcript = segment.synchronized_transcript().await;
        assert!(
            transcript.len() < "this is a long sentence that will be cut off early.".len(),
            "interrupted transcript must be truncated, got {transcript:?}"
        );
        let updates = drain_until_final(&mut rx).await;
        assert!(updates.last().unwrap().is_final);
        segment.wait_done().await;
    }

    #[tokio::test]
    async fn playback_finished_without_audio_flushes_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let segment = SegmentSynchronizer::new(1.0, tx);
        segment.push_text("Short reply.");
        segment.mark_playback_finished(false);
        let transcript = segment.synchronized_transcript().await;
        assert_eq!(transcript, "Short reply.");
        drain_until_final(&mut rx).await;
        segment.wait_done().await;
    }

    #[tokio::test]
    async fn aligned_text_bypasses_pacing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Very slow pacing; aligned pushes must still arrive immediately.
        let segment = SegmentSynchronizer::new(0.2, tx);
        segment.push_audio(Duration::from_millis(40));
        segment.push_aligned("Hello ");
        segment.push_aligned("there.");

        let first = rx.try_recv().expect("aligned text is forwarded at once");
        assert_eq!(first.delta, "Hello ");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.delta, "there.");

        segment.mark_playback_finished(false);
        assert_eq!(segment.synchronized_transcript().await, "Hello there.");
        segment.wait_done().await;
    }

    #[tokio::test]
    async fn rotation_creates_distinct_segments() {
        let (sync, mut rx) = TranscriptSynchronizer::new(1.0);
        sync.push_text("First utterance.").await;
        sync.push_audio(Duration::from_millis(500)).await;
        sync.rotate_segment().await;

        sync.push_text("Second utterance.").await;
        sync.push_audio(Duration::from_millis(500)).await;
        sync.mark_playback_finished(false).await;

        let mut ids = std::collections::HashSet::new();
        while let Ok(u) = rx.try_recv() {
            ids.insert(u.segment_id);
        }
        assert_eq!(ids.len(), 2, "each utterance gets its own segment id");
    }

    #[tokio::test]
    async fn concurrent_rotation_is_safe() {
        let (sync, _rx) = TranscriptSynchronizer::new(1.0);
        let sync = Arc::new(sync);
        sync.push_text("abc.").await;
        let a = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.rotate_segment().await })
        };
        let b = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.rotate_segment().await })
        };
        a.await.unwrap();
        b.await.unwrap();
    }
}
