//! Opaque room transports.
//!
//! The media server SDK is out of scope; the session only needs three
//! narrow seams: a microphone frame stream (a plain
//! [`StreamReader<AudioFrame>`](crate::sync::chan::StreamReader)), an audio
//! publisher with playback acknowledgement, and a transcription sink.
//! [`LoopbackAudioOutput`] is the in-process implementation used by the dev
//! CLI and the test suite: it "plays" frames in real time (or instantly)
//! and reports playback positions like a real publisher.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::audio::AudioFrame;
use crate::error::{Result, VoxaError};
use crate::sync::promise::Promise;

/// Playback acknowledgement from the audio publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackFinished {
    /// How much audio was actually played.
    pub playback_position: Duration,
    /// Whether playback was cut short.
    pub interrupted: bool,
}

/// Publishes agent audio into the room and reports playback progress.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Queue a frame for playout. May suspend under backpressure.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the output is closed.
    async fn capture_frame(&self, frame: AudioFrame) -> Result<()>;

    /// Mark the end of the current utterance's audio.
    fn flush(&self);

    /// Drop all queued audio (interruption truncation).
    fn clear_buffer(&self);

    /// Wait for the current utterance to finish playing (or be cleared).
    async fn wait_for_playout(&self) -> PlaybackFinished;
}

/// One transcription segment for the room's transcription channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionSegment {
    /// Segment id (stable across deltas of one utterance).
    pub id: String,
    /// Participant this text is attributed to.
    pub participant_identity: String,
    /// Newly forwarded text.
    pub text: String,
    /// Whether the segment is complete.
    pub is_final: bool,
    /// Language tag, when known.
    pub language: Option<String>,
}

/// Publishes transcription segments into the room.
#[async_trait]
pub trait TextOutput: Send + Sync {
    /// Publish one segment update.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the sink is closed.
    async fn publish(&self, segment: TranscriptionSegment) -> Result<()>;
}

/// A [`TextOutput`] that collects segments in memory (tests, dev console).
#[derive(Default)]
pub struct BufferedTextOutput {
    segments: Mutex<Vec<TranscriptionSegment>>,
}

impl BufferedTextOutput {
    /// Create an empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All published segments so far.
    pub fn segments(&self) -> Vec<TranscriptionSegment> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TextOutput for BufferedTextOutput {
    async fn publish(&self, segment: TranscriptionSegment) -> Result<()> {
        self.segments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(segment);
        Ok(())
    }
}

struct PlayoutState {
    queue: VecDeque<AudioFrame>,
    played: Duration,
    flushed: bool,
    cleared: bool,
    closed: bool,
    playout: Promise<PlaybackFinished>,
}

/// In-process audio publisher with simulated playout.
///
/// `realtime` sleeps for each frame's duration (dev mode); otherwise frames
/// play instantly (tests).
pub struct LoopbackAudioOutput {
    state: Mutex<PlayoutState>,
    wake: Notify,
    realtime: bool,
}

impl LoopbackAudioOutput {
    /// Create a publisher and start its player task.
    pub fn new(realtime: bool) -> Arc<Self> {
        let out = Arc::new(Self {
            state: Mutex::new(PlayoutState {
                queue: VecDeque::new(),
                played: Duration::ZERO,
                flushed: false,
                cleared: false,
                closed: false,
                playout: Promise::new(),
            }),
            wake: Notify::new(),
            realtime,
        });
        let player = Arc::clone(&out);
        tokio::spawn(async move {
            loop {
                if player.lock().closed {
                    break;
                }
                if !player.step().await {
                    player.wake.notified().await;
                }
            }
        });
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlayoutState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total audio played across all utterances.
    pub fn played(&self) -> Duration {
        self.lock().played
    }

    /// Stop the player task.
    pub fn close(&self) {
        self.lock().closed = true;
        self.wake.notify_one();
    }

    /// Play one frame or finish an utterance. Returns `false` when idle.
    async fn step(&self) -> bool {
        let frame = {
            let mut state = self.lock();
            match state.queue.pop_front() {
                Some(frame) => Some(frame),
                None => {
                    if state.flushed {
                        // Utterance complete.
                        let finished = PlaybackFinished {
                            playback_position: state.played,
                            interrupted: false,
                        };
                        state.flushed = false;
                        state.playout.resolve(finished);
                    }
                    None
                }
            }
        };
        match frame {
            Some(frame) => {
                if self.realtime {
                    tokio::time::sleep(frame.duration()).await;
                }
                let mut state = self.lock();
                if !state.cleared {
                    state.played += frame.duration();
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AudioOutput for LoopbackAudioOutput {
    async fn capture_frame(&self, frame: AudioFrame) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(VoxaError::Channel("audio output closed".into()));
            }
            state.cleared = false;
            state.queue.push_back(frame);
        }
        self.wake.notify_one();
        Ok(())
    }

    fn flush(&self) {
        self.lock().flushed = true;
        self.wake.notify_one();
    }

    fn clear_buffer(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.flushed = false;
        state.cleared = true;
        let finished = PlaybackFinished {
            playback_position: state.played,
            interrupted: true,
        };
        state.playout.resolve(finished);
    }

    async fn wait_for_playout(&self) -> PlaybackFinished {
        let playout = self.lock().playout.clone();
        let finished = playout.wait().await;
        // Re-arm for the next utterance.
        let mut state = self.lock();
        state.playout = Promise::new();
        state.played = Duration::ZERO;
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn playout_reports_position_and_completion() {
        let out = LoopbackAudioOutput::new(false);
        out.capture_frame(AudioFrame::silence(480, 48_000, 1))
            .await
            .unwrap();
        out.capture_frame(AudioFrame::silence(480, 48_000, 1))
            .await
            .unwrap();
        out.flush();
        let finished = out.wait_for_playout().await;
        assert!(!finished.interrupted);
        assert_eq!(finished.playback_position, Duration::from_millis(20));
        out.close();
    }

    #[tokio::test]
    async fn clear_buffer_interrupts_with_partial_position() {
        let out = LoopbackAudioOutput::new(false);
        // Nothing played yet; clearing reports zero progress.
        out.capture_frame(AudioFrame::silence(48_000, 48_000, 1))
            .await
            .unwrap();
        out.clear_buffer();
        let finished = out.wait_for_playout().await;
        assert!(finished.interrupted);
        assert!(finished.playback_position < Duration::from_secs(1));
        out.close();
    }

    #[tokio::test]
    async fn buffered_text_output_collects_segments() {
        let sink = BufferedTextOutput::new();
        sink.publish(TranscriptionSegment {
            id: "s1".into(),
            participant_identity: "agent".into(),
            text: "hello ".into(),
            is_final: false,
            language: None,
        })
        .await
        .unwrap();
        assert_eq!(sink.segments().len(), 1);
    }
}
