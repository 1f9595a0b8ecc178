//! Adaptive interruption detection (overlap-speech classification).
//!
//! While the agent is speaking and the user starts talking, the session
//! feeds this detector the overlap audio. A remote classifier scores each
//! detection window; a sustained score above the threshold means the user
//! intends to interrupt (rather than back-channel "mm-hm" noises), and the
//! session preempts the active speech handle.
//!
//! The stream accepts control sentinels and audio frames, keeps a sliding
//! ring of recent samples, and rolls per-window probabilities up through a
//! bounded cache of in-flight inference results.

pub mod transport;

use std::time::Instant;

use tracing::{debug, warn};

use crate::audio::{AudioFrame, AudioRingBuffer};
use crate::config::InterruptionOptions;
use crate::error::Result;
use crate::sync::cache::BoundedCache;
use crate::sync::chan::{StreamReader, StreamWriter, stream_channel_with_capacity};
use crate::sync::task::{TaskHandle, cancellable_sleep};

use transport::{HttpTransport, InterruptionTransport, WsTransport};

/// Seconds of audio covered by one model probability frame.
pub const FRAME_DURATION_S: f64 = 0.08;

/// Maximum in-flight inference results kept per overlap.
pub const CACHE_MAX_ENTRIES: usize = 10;

/// Rolled-up score: the best sustained probability.
///
/// For every window of `window` consecutive frames, take the minimum
/// probability inside it; return the maximum of those minima. A high value
/// means the classifier stayed confident for at least the minimum
/// interruption duration.
pub fn sliding_window_min_max(probabilities: &[f32], window: usize) -> f32 {
    if probabilities.is_empty() {
        return 0.0;
    }
    let window = window.clamp(1, probabilities.len());
    probabilities
        .windows(window)
        .map(|w| w.iter().copied().fold(f32::INFINITY, f32::min))
        .fold(0.0, f32::max)
}

/// One in-flight or completed inference result.
#[derive(Debug, Clone)]
pub struct InterruptionCacheEntry {
    /// When the request was issued.
    pub created_at: Instant,
    /// Seconds of audio analyzed; zero while the request is in flight.
    pub total_duration_s: f64,
    /// Seconds the prediction covers.
    pub prediction_duration_s: f64,
    /// Seconds from overlap start to this result's arrival.
    pub detection_delay_s: f64,
    /// Transcript context sent with the request, when available.
    pub speech_input: Option<String>,
    /// Raw per-frame probabilities.
    pub probabilities: Option<Vec<f32>>,
    /// Whether this result crossed the threshold.
    pub is_interruption: Option<bool>,
    /// Rolled-up probability ([`sliding_window_min_max`]).
    pub probability: f32,
}

impl InterruptionCacheEntry {
    fn pending(speech_input: Option<String>) -> Self {
        Self {
            created_at: Instant::now(),
            total_duration_s: 0.0,
            prediction_duration_s: 0.0,
            detection_delay_s: 0.0,
            speech_input,
            probabilities: None,
            is_interruption: None,
            probability: 0.0,
        }
    }
}

/// The kind of an interruption event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionEventType {
    /// The classifier decided the user intends to interrupt.
    Interruption,
    /// The overlap ended; carries the final rollup.
    OverlapSpeechEnded,
}

/// An event from the detector.
#[derive(Debug, Clone)]
pub struct InterruptionEvent {
    /// Event kind.
    pub event_type: InterruptionEventType,
    /// When the event was produced.
    pub timestamp: Instant,
    /// Whether the rolled-up probability crossed the threshold.
    pub is_interruption: bool,
    /// Seconds of audio analyzed by the deciding inference.
    pub total_duration_s: f64,
    /// Seconds the deciding prediction covers.
    pub prediction_duration_s: f64,
    /// Seconds from overlap start to the decision.
    pub detection_delay_s: f64,
    /// When the overlap began.
    pub overlap_speech_started_at: Option<Instant>,
    /// Raw per-frame probabilities of the deciding inference.
    pub probabilities: Option<Vec<f32>>,
    /// Rolled-up probability.
    pub probability: f32,
    /// Transcript context of the deciding inference.
    pub speech_input: Option<String>,
}

/// Input to the detector stream.
#[derive(Debug, Clone)]
pub enum DetectorInput {
    /// The agent started speaking; reset buffers and cache.
    AgentSpeechStarted,
    /// The agent finished speaking.
    AgentSpeechEnded,
    /// User speech overlapping agent speech began `speech_duration_s`
    /// seconds ago (VAD latency back-dating).
    OverlapSpeechStarted {
        /// Seconds of user speech already elapsed when detected.
        speech_duration_s: f64,
        /// Transcript context for the overlap, when the STT has one.
        transcript: Option<String>,
    },
    /// The overlapping user speech ended.
    OverlapSpeechEnded,
    /// Run inference immediately on the buffered audio.
    Flush,
    /// Overlap audio.
    Frame(AudioFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorPhase {
    Idle,
    AgentSpeaking,
    Overlap,
    /// An interruption was already reported for this overlap.
    Decided,
}

/// Handle to a running interruption-detector stream.
pub struct InterruptionDetector {
    input: StreamWriter<DetectorInput>,
    events: StreamReader<InterruptionEvent>,
    task: TaskHandle<()>,
}

impl InterruptionDetector {
    /// Start a detector with the transport selected by the options.
    pub fn new(options: InterruptionOptions) -> Self {
        let transport: Box<dyn InterruptionTransport> = if options.use_websocket {
            Box::new(WsTransport::new(options.clone()))
        } else {
            Box::new(HttpTransport::new(options.clone()))
        };
        Self::with_transport(options, transport)
    }

    /// Start a detector over an explicit transport (used by tests).
    pub fn with_transport(
        options: InterruptionOptions,
        transport: Box<dyn InterruptionTransport>,
    ) -> Self {
        let (input, input_rx) = stream_channel_with_capacity(64);
        let (events_tx, events) = stream_channel_with_capacity(16);
        let task = TaskHandle::spawn(move |cancel| async move {
            let mut stream = DetectorStream::new(options, transport);
            stream.run(input_rx, events_tx, cancel).await;
        });
        Self {
            input,
            events,
            task,
        }
    }

    /// Send a control sentinel or audio frame.
    ///
    /// # Errors
    ///
    /// Returns a channel error once the detector is closed.
    pub async fn send(&mut self, input: DetectorInput) -> Result<()> {
        self.input.write(input).await
    }

    /// Next detector event, or `None` after close.
    pub async fn next_event(&mut self) -> Option<InterruptionEvent> {
        self.events.recv().await
    }

    /// Stop the detector and release the transport.
    pub async fn close(mut self) {
        self.input.close();
        let _ = self.task.cancel_and_wait().await;
    }

    /// Decompose into the input writer, event reader, and worker task so a
    /// single owner can pump both directions from one select loop. Closing
    /// the writer (and cancelling the task) shuts the detector down.
    pub fn split(
        self,
    ) -> (
        StreamWriter<DetectorInput>,
        StreamReader<InterruptionEvent>,
        TaskHandle<()>,
    ) {
        (self.input, self.events, self.task)
    }
}

struct DetectorStream {
    options: InterruptionOptions,
    transport: Box<dyn InterruptionTransport>,
    ring: AudioRingBuffer,
    cache: BoundedCache<String, InterruptionCacheEntry>,
    phase: DetectorPhase,
    overlap_started_at: Option<Instant>,
    overlap_transcript: Option<String>,
    samples_since_inference: usize,
}

impl DetectorStream {
    fn new(options: InterruptionOptions, transport: Box<dyn InterruptionTransport>) -> Self {
        let capacity = (options.max_audio_duration_s * f64::from(options.sample_rate)) as usize;
        Self {
            ring: AudioRingBuffer::new(capacity.max(1)),
            cache: BoundedCache::new(CACHE_MAX_ENTRIES),
            phase: DetectorPhase::Idle,
            overlap_started_at: None,
            overlap_transcript: None,
            samples_since_inference: 0,
            options,
            transport,
        }
    }

    fn interval_samples(&self) -> usize {
        ((self.options.detection_interval_s * f64::from(self.options.sample_rate)) as usize).max(1)
    }

    async fn run(
        &mut self,
        mut input: StreamReader<DetectorInput>,
        mut events: StreamWriter<InterruptionEvent>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => break,
                item = input.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match item {
                DetectorInput::AgentSpeechStarted => {
                    self.ring.reset();
                    self.cache.clear();
                    self.phase = DetectorPhase::AgentSpeaking;
                    self.overlap_started_at = None;
                    self.samples_since_inference = 0;
                }
                DetectorInput::AgentSpeechEnded => {
                    if self.phase == DetectorPhase::AgentSpeaking {
                        self.phase = DetectorPhase::Idle;
                    }
                }
                DetectorInput::OverlapSpeechStarted {
                    speech_duration_s,
                    transcript,
                } => {
                    if matches!(self.phase, DetectorPhase::AgentSpeaking) {
                        let context_s = speech_duration_s + self.options.audio_prefix_duration_s;
                        let context_samples =
                            (context_s * f64::from(self.options.sample_rate)).round() as usize;
                        self.ring.start_segment(context_samples);
                        self.phase = DetectorPhase::Overlap;
                        self.overlap_started_at = Some(Instant::now());
                        self.overlap_transcript = transcript;
                        self.samples_since_inference = 0;
                        debug!(speech_duration_s, "overlap speech started");
                    }
                }
                DetectorInput::OverlapSpeechEnded => {
                    if matches!(self.phase, DetectorPhase::Overlap | DetectorPhase::Decided) {
                        let ev = self.overlap_ended_event();
                        let _ = events.write(ev).await;
                        self.phase = DetectorPhase::AgentSpeaking;
                        self.overlap_started_at = None;
                        self.overlap_transcript = None;
                        self.ring.mark_end();
                    }
                }
                DetectorInput::Flush => {
                    if self.phase == DetectorPhase::Overlap {
                        self.run_inference(&mut events, &cancel).await;
                    }
                }
                DetectorInput::Frame(frame) => {
                    let mono = frame.mixed_to_mono();
                    self.ring.push(&mono.data);
                    match self.phase {
                        DetectorPhase::Overlap => {
                            self.samples_since_inference += mono.data.len();
                            if self.samples_since_inference >= self.interval_samples() {
                                self.samples_since_inference = 0;
                                self.run_inference(&mut events, &cancel).await;
                            }
                        }
                        DetectorPhase::Decided => {}
                        _ => self.ring.mark_end(),
                    }
                }
            }
        }
        self.transport.close().await;
        events.close();
    }

    async fn run_inference(
        &mut self,
        events: &mut StreamWriter<InterruptionEvent>,
        cancel: &tokio_util::sync::CancellationToken,
    ) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let transcript = self.overlap_transcript.clone();
        self.cache.set_or_update(
            request_id.clone(),
            || InterruptionCacheEntry::pending(transcript.clone()),
            |_| {},
        );

        let pcm: Vec<i16> = self.ring.segment_audio().to_vec();
        let result = match self.infer_with_retry(&pcm, transcript.as_deref(), cancel).await {
            Some(result) => result,
            None => return,
        };

        let min_window = transport::min_frames(&self.options);
        let probability = sliding_window_min_max(&result.probabilities, min_window);
        let threshold = self.options.threshold;
        let detection_delay_s = self
            .overlap_started_at
            .map_or(0.0, |t| t.elapsed().as_secs_f64());

        self.cache.set_or_update(
            request_id,
            || InterruptionCacheEntry::pending(transcript.clone()),
            |entry| {
                entry.total_duration_s = result.total_duration_s;
                entry.prediction_duration_s = result.prediction_duration_s;
                entry.detection_delay_s = detection_delay_s;
                entry.probabilities = Some(result.probabilities.clone());
                entry.probability = probability;
                entry.is_interruption = Some(probability > threshold);
            },
        );

        if probability > threshold {
            let ev = InterruptionEvent {
                event_type: InterruptionEventType::Interruption,
                timestamp: Instant::now(),
                is_interruption: true,
                total_duration_s: result.total_duration_s,
                prediction_duration_s: result.prediction_duration_s,
                detection_delay_s,
                overlap_speech_started_at: self.overlap_started_at,
                probabilities: Some(result.probabilities),
                probability,
                speech_input: self.overlap_transcript.clone(),
            };
            let _ = events.write(ev).await;
            self.phase = DetectorPhase::Decided;
        }
    }

    async fn infer_with_retry(
        &mut self,
        pcm: &[i16],
        transcript: Option<&str>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Option<transport::InferenceResult> {
        let max_retry = self.options.conn.max_retry;
        for attempt in 0..=max_retry {
            match self.transport.infer(pcm, transcript).await {
                Ok(result) => return Some(result),
                Err(e) if e.retryable() && attempt < max_retry => {
                    let backoff = self.options.conn.interval_for_retry(attempt);
                    warn!("interruption inference attempt {attempt} failed ({e}), retrying");
                    if cancellable_sleep(backoff, cancel).await.is_err() {
                        return None;
                    }
                }
                Err(e) => {
                    // Detection is advisory: log and keep the overlap alive.
                    warn!("interruption inference failed: {e}");
                    return None;
                }
            }
        }
        None
    }

    fn overlap_ended_event(&mut self) -> InterruptionEvent {
        // Most recent *completed* inference wins (LIFO predicate pop).
        let entry = self
            .cache
            .pop_where(|_, entry| entry.total_duration_s > 0.0)
            .map(|(_, entry)| entry);
        let threshold = self.options.threshold;
        match entry {
            Some(entry) => InterruptionEvent {
                event_type: InterruptionEventType::OverlapSpeechEnded,
                timestamp: Instant::now(),
                is_interruption: entry.is_interruption.unwrap_or(entry.probability > threshold),
                total_duration_s: entry.total_duration_s,
                prediction_duration_s: entry.prediction_duration_s,
                detection_delay_s: entry.detection_delay_s,
                overlap_speech_started_at: self.overlap_started_at,
                probabilities: entry.probabilities,
                probability: entry.probability,
                speech_input: entry.speech_input,
            },
            None => InterruptionEvent {
                event_type: InterruptionEventType::OverlapSpeechEnded,
                timestamp: Instant::now(),
                is_interruption: false,
                total_duration_s: 0.0,
                prediction_duration_s: 0.0,
                detection_delay_s: 0.0,
                overlap_speech_started_at: self.overlap_started_at,
                probabilities: None,
                probability: 0.0,
                speech_input: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transport::{InferenceResult, InterruptionTransport};
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── rollup ────────────────────────────────────────────────

    #[test]
    fn rollup_is_max_of_windowed_min() {
        // Window 2: minima are [0.1, 0.6, 0.6, 0.2] → max 0.6.
        let probs = [0.1, 0.9, 0.6, 0.7, 0.2];
        assert!((sliding_window_min_max(&probs, 2) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn rollup_requires_sustained_confidence() {
        // One spike doesn't survive a window of 3.
        let probs = [0.1, 0.95, 0.1, 0.1];
        assert!(sliding_window_min_max(&probs, 3) < 0.2);
    }

    #[test]
    fn rollup_handles_short_and_empty_input() {
        assert_eq!(sliding_window_min_max(&[], 5), 0.0);
        // Window larger than input clamps to the full slice.
        assert!((sliding_window_min_max(&[0.4, 0.8], 5) - 0.4).abs() < 1e-6);
    }

    // ── detector stream ───────────────────────────────────────

    struct ScriptedTransport {
        results: Vec<InferenceResult>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InterruptionTransport for ScriptedTransport {
        async fn infer(
            &mut self,
            _pcm: &[i16],
            _transcript: Option<&str>,
        ) -> crate::error::Result<InferenceResult> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .results
                .get(idx.min(self.results.len().saturating_sub(1)))
                .cloned()
                .unwrap_or_default())
        }
        async fn update_options(&mut self, _options: &InterruptionOptions) {}
        async fn close(&mut self) {}
    }

    fn test_options() -> InterruptionOptions {
        InterruptionOptions {
            sample_rate: 16_000,
            threshold: 0.5,
            min_interruption_duration_s: 0.16,
            audio_prefix_duration_s: 0.5,
            max_audio_duration_s: 10.0,
            detection_interval_s: 0.1,
            ..InterruptionOptions::default()
        }
    }

    fn overlap_frame() -> DetectorInput {
        DetectorInput::Frame(AudioFrame::new(vec![1_000; 1_600], 16_000, 1))
    }

    async fn drive_overlap(
        results: Vec<InferenceResult>,
        frames: usize,
    ) -> (Vec<InterruptionEvent>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = Box::new(ScriptedTransport {
            results,
            calls: Arc::clone(&calls),
        });
        let mut detector = InterruptionDetector::with_transport(test_options(), transport);
        detector.send(DetectorInput::AgentSpeechStarted).await.unwrap();
        detector
            .send(DetectorInput::OverlapSpeechStarted {
                speech_duration_s: 0.4,
                transcript: Some("wait actually".into()),
            })
            .await
            .unwrap();
        for _ in 0..frames {
            detector.send(overlap_frame()).await.unwrap();
        }
        detector.send(DetectorInput::OverlapSpeechEnded).await.unwrap();

        let mut events = Vec::new();
        while let Some(ev) = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            detector.next_event(),
        )
        .await
        .ok()
        .flatten()
        {
            let done = ev.event_type == InterruptionEventType::OverlapSpeechEnded;
            events.push(ev);
            if done {
                break;
            }
        }
        detector.close().await;
        (events, calls)
    }

    #[tokio::test]
    async fn sustained_high_probability_emits_interruption() {
        let strong = InferenceResult {
            probabilities: vec![0.82; 8],
            total_duration_s: 0.9,
            prediction_duration_s: 0.64,
        };
        let (events, _) = drive_overlap(vec![strong], 3).await;
        let interruption = events
            .iter()
            .find(|e| e.event_type == InterruptionEventType::Interruption)
            .expect("interruption event");
        assert!(interruption.is_interruption);
        assert!(interruption.probability > 0.5);
        assert_eq!(interruption.speech_input.as_deref(), Some("wait actually"));
    }

    #[tokio::test]
    async fn low_probability_reports_non_interruption_on_overlap_end() {
        let weak = InferenceResult {
            probabilities: vec![0.2; 8],
            total_duration_s: 0.9,
            prediction_duration_s: 0.64,
        };
        let (events, _) = drive_overlap(vec![weak], 3).await;
        assert!(
            events
                .iter()
                .all(|e| e.event_type != InterruptionEventType::Interruption)
        );
        let ended = events.last().expect("overlap-ended event");
        assert_eq!(ended.event_type, InterruptionEventType::OverlapSpeechEnded);
        assert!(!ended.is_interruption);
        assert!(ended.total_duration_s > 0.0, "uses the completed cache entry");
    }

    #[tokio::test]
    async fn no_inference_yields_default_overlap_end() {
        let (events, calls) = drive_overlap(vec![InferenceResult::default()], 0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no frames, no inference");
        let ended = events.last().expect("overlap-ended event");
        assert_eq!(ended.total_duration_s, 0.0);
        assert!(!ended.is_interruption);
    }

    #[tokio::test]
    async fn decided_overlap_fires_only_one_interruption() {
        let strong = InferenceResult {
            probabilities: vec![0.95; 8],
            total_duration_s: 0.9,
            prediction_duration_s: 0.64,
        };
        let (events, _) = drive_overlap(vec![strong.clone(), strong], 6).await;
        let count = events
            .iter()
            .filter(|e| e.event_type == InterruptionEventType::Interruption)
            .count();
        assert_eq!(count, 1);
    }
}
