//! Voice activity detection.
//!
//! The [`Vad`] trait is the capability seam; [`EnergyVad`] is the built-in
//! implementation using smoothed RMS energy gating. Model-based detectors
//! plug in behind the same trait.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::audio::{AudioFrame, ExpFilter};
use crate::config::VadOptions;
use crate::error::Result;
use crate::sync::chan::{StreamReader, StreamWriter, stream_channel_with_capacity};

/// The kind of a VAD event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEventType {
    /// Speech onset confirmed (after the minimum speech duration).
    StartOfSpeech,
    /// One inference window processed.
    InferenceDone,
    /// Speech ended (after the configured silence wait).
    EndOfSpeech,
}

/// A voice-activity event.
#[derive(Debug, Clone)]
pub struct VadEvent {
    /// Event kind.
    pub event_type: VadEventType,
    /// Total samples processed when the event fired.
    pub samples_index: u64,
    /// Offset from stream start.
    pub timestamp: Duration,
    /// Accumulated silence. For [`VadEventType::EndOfSpeech`] this already
    /// includes the configured silence wait.
    pub silence_duration: Duration,
    /// Duration of the detected speech segment.
    pub speech_duration: Duration,
    /// Smoothed speech probability for the last window.
    pub probability: f32,
    /// Whether the detector currently considers the user speaking.
    pub speaking: bool,
    /// Buffered frames for the event (prefix padding + speech).
    pub frames: Vec<AudioFrame>,
    /// Unsmoothed accumulated silence since the last transition.
    pub raw_accumulated_silence: Duration,
    /// Unsmoothed accumulated speech since the last transition.
    pub raw_accumulated_speech: Duration,
}

/// A live VAD stream: audio in, events out.
pub struct VadStream {
    /// Audio input half.
    pub input: StreamWriter<AudioFrame>,
    /// Detected events.
    pub events: StreamReader<VadEvent>,
}

impl VadStream {
    /// Push an audio frame.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the stream input is closed.
    pub async fn push_frame(&mut self, frame: AudioFrame) -> Result<()> {
        self.input.write(frame).await
    }

    /// Close the input; the event stream ends after draining.
    pub fn end_input(&mut self) {
        self.input.close();
    }

    /// Next event, or `None` at end of stream.
    pub async fn next_event(&mut self) -> Option<VadEvent> {
        self.events.recv().await
    }
}

/// Voice-activity-detection capability.
#[async_trait]
pub trait Vad: Send + Sync {
    /// Provider label for logs and errors.
    fn label(&self) -> &str;

    /// Open a detection stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the detector cannot start.
    async fn stream(&self) -> Result<VadStream>;
}

/// RMS level treated as full-confidence speech.
const SPEECH_RMS_REFERENCE: f32 = 0.05;

/// Energy-based voice activity detector.
///
/// Maps frame RMS to a pseudo-probability, smooths it with an
/// [`ExpFilter`], and runs a hysteresis state machine with minimum speech
/// and silence durations plus prefix padding.
pub struct EnergyVad {
    options: VadOptions,
}

impl EnergyVad {
    /// Create a detector with the given options.
    pub fn new(options: VadOptions) -> Self {
        Self { options }
    }

    /// Create a detector with default options.
    pub fn with_defaults() -> Arc<Self> {
        Arc::new(Self::new(VadOptions::default()))
    }
}

#[async_trait]
impl Vad for EnergyVad {
    fn label(&self) -> &str {
        "energy-vad"
    }

    async fn stream(&self) -> Result<VadStream> {
        let (input, frame_rx) = stream_channel_with_capacity(64);
        let (events_tx, events) = stream_channel_with_capacity(64);
        let options = self.options.clone();
        tokio::spawn(run_detector(options, frame_rx, events_tx));
        Ok(VadStream { input, events })
    }
}

struct DetectorState {
    filter: ExpFilter,
    speaking: bool,
    samples_index: u64,
    elapsed: Duration,
    accumulated_speech: Duration,
    accumulated_silence: Duration,
    prefix: VecDeque<AudioFrame>,
    prefix_duration: Duration,
    segment: Vec<AudioFrame>,
    segment_duration: Duration,
    buffer_warned: bool,
}

async fn run_detector(
    options: VadOptions,
    mut frames: StreamReader<AudioFrame>,
    mut events: StreamWriter<VadEvent>,
) {
    let min_speech = Duration::from_millis(options.min_speech_duration_ms);
    let min_silence = Duration::from_millis(options.min_silence_duration_ms);
    let prefix_padding = Duration::from_millis(options.prefix_padding_ms);
    let max_buffered = Duration::from_millis(options.max_buffered_speech_ms);

    let mut st = DetectorState {
        filter: ExpFilter::default(),
        speaking: false,
        samples_index: 0,
        elapsed: Duration::ZERO,
        accumulated_speech: Duration::ZERO,
        accumulated_silence: Duration::ZERO,
        prefix: VecDeque::new(),
        prefix_duration: Duration::ZERO,
        segment: Vec::new(),
        segment_duration: Duration::ZERO,
        buffer_warned: false,
    };

    while let Some(frame) = frames.recv().await {
        let mono = frame.mixed_to_mono();
        let frame_len = mono.duration();
        st.samples_index += mono.samples_per_channel as u64;
        st.elapsed += frame_len;

        let raw_p = (mono.rms() / SPEECH_RMS_REFERENCE).min(1.0);
        let probability = st.filter.apply(raw_p);
        let is_speech = probability >= options.activation_threshold;

        // Keep a rolling prefix of quiet audio while idle so onsets don't
        // clip the first phoneme. Speech frames go to the segment buffer.
        if !st.speaking && !is_speech {
            st.prefix.push_back(mono.clone());
            st.prefix_duration += frame_len;
            while st.prefix_duration > prefix_padding {
                if let Some(dropped) = st.prefix.pop_front() {
                    st.prefix_duration = st.prefix_duration.saturating_sub(dropped.duration());
                } else {
                    break;
                }
            }
        }

        if is_speech {
            st.accumulated_silence = Duration::ZERO;
            st.accumulated_speech += frame_len;
            if st.segment_duration < max_buffered {
                st.segment.push(mono.clone());
                st.segment_duration += frame_len;
            } else if !st.buffer_warned {
                warn!(
                    "VAD speech buffer reached {}ms cap, no longer growing",
                    options.max_buffered_speech_ms
                );
                st.buffer_warned = true;
            }
            if !st.speaking && st.accumulated_speech >= min_speech {
                st.speaking = true;
                let mut onset_frames: Vec<AudioFrame> = st.prefix.drain(..).collect();
                onset_frames.extend(st.segment.iter().cloned());
                st.prefix_duration = Duration::ZERO;
                let ev = event(&st, VadEventType::StartOfSpeech, probability, onset_frames);
                if events.write(ev).await.is_err() {
                    return;
                }
            }
        } else {
            st.accumulated_silence += frame_len;
            if st.speaking {
                // Silence inside the tolerance still belongs to the segment.
                if st.segment_duration < max_buffered {
                    st.segment.push(mono.clone());
                    st.segment_duration += frame_len;
                }
                if st.accumulated_silence >= min_silence {
                    st.speaking = false;
                    let frames_out = std::mem::take(&mut st.segment);
                    let ev = event(&st, VadEventType::EndOfSpeech, probability, frames_out);
                    if events.write(ev).await.is_err() {
                        return;
                    }
                    st.segment_duration = Duration::ZERO;
                    st.accumulated_speech = Duration::ZERO;
                    st.buffer_warned = false;
                }
            } else {
                // The blip never reached the minimum speech duration;
                // drop its frames so they don't pollute the next segment.
                st.accumulated_speech = Duration::ZERO;
                st.segment.clear();
                st.segment_duration = Duration::ZERO;
            }
        }

        let ev = event(&st, VadEventType::InferenceDone, probability, Vec::new());
        if events.write(ev).await.is_err() {
            return;
        }
    }
    events.close();
}

fn event(
    st: &DetectorState,
    event_type: VadEventType,
    probability: f32,
    frames: Vec<AudioFrame>,
) -> VadEvent {
    VadEvent {
        event_type,
        samples_index: st.samples_index,
        timestamp: st.elapsed,
        silence_duration: st.accumulated_silence,
        speech_duration: st.segment_duration,
        probability,
        speaking: st.speaking,
        frames,
        raw_accumulated_silence: st.accumulated_silence,
        raw_accumulated_speech: st.accumulated_speech,
    }
}
