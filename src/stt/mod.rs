//! Speech-to-text capability contract.
//!
//! Providers normalize their vendor-specific streaming APIs into
//! [`SpeechEvent`]s: interim and final transcripts, speech boundaries, and
//! — for engines that support eager endpointing — preflight transcripts
//! that the session may use for preemptive generation without committing
//! the turn.

use async_trait::async_trait;

use crate::audio::AudioFrame;
use crate::error::Result;
use crate::sync::chan::{StreamReader, StreamWriter};

/// The kind of a speech event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeechEventType {
    /// The provider detected the start of speech.
    StartOfSpeech,
    /// A partial transcript; will be revised.
    InterimTranscript,
    /// A committed transcript for a span of audio.
    FinalTranscript,
    /// An eager end-of-turn transcript — usable for preemptive generation
    /// but not a commitment.
    PreflightTranscript,
    /// The provider detected the end of speech.
    EndOfSpeech,
    /// Usage accounting for the stream.
    RecognitionUsage,
}

/// One transcription alternative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeechData {
    /// Transcript text.
    pub text: String,
    /// BCP-47 language tag, when detected.
    pub language: Option<String>,
    /// Start of the span, seconds from stream start.
    pub start_time: f64,
    /// End of the span, seconds from stream start.
    pub end_time: f64,
    /// Provider confidence in [0, 1].
    pub confidence: f32,
}

/// A normalized event from an STT stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechEvent {
    /// Event kind.
    pub event_type: SpeechEventType,
    /// Provider request id.
    pub request_id: String,
    /// Transcription alternatives, best first.
    pub alternatives: Vec<SpeechData>,
}

impl SpeechEvent {
    /// The best alternative's text, if any.
    pub fn text(&self) -> Option<&str> {
        self.alternatives.first().map(|a| a.text.as_str())
    }

    /// The best alternative's language, if any.
    pub fn language(&self) -> Option<&str> {
        self.alternatives.first().and_then(|a| a.language.as_deref())
    }
}

/// What an STT implementation supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SttCapabilities {
    /// Supports streaming recognition.
    pub streaming: bool,
    /// Emits interim transcripts.
    pub interim_results: bool,
    /// Emits preflight (eager end-of-turn) transcripts.
    pub preflight_transcripts: bool,
    /// Word-level timing on final transcripts.
    pub aligned_transcript: bool,
}

/// Per-stream recognition options.
#[derive(Debug, Clone)]
pub struct SttOptions {
    /// Input sample rate in Hz.
    pub sample_rate: u32,
    /// Request interim transcripts.
    pub interim_results: bool,
    /// Hint language, if fixed.
    pub language: Option<String>,
}

impl Default for SttOptions {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            interim_results: true,
            language: None,
        }
    }
}

/// Input to an STT stream: audio or the flush sentinel.
#[derive(Debug, Clone)]
pub enum SttInput {
    /// An audio frame.
    Frame(AudioFrame),
    /// Force the provider to finalize buffered audio.
    Flush,
}

/// A live recognition stream: an audio sink and an event source.
///
/// Providers spawn their own bridging task; closing the input ends the
/// stream after remaining events drain.
pub struct SttStream {
    /// Audio input half.
    pub input: StreamWriter<SttInput>,
    /// Recognized events. `Err` items are recoverable or fatal per
    /// [`crate::error::VoxaError::retryable`].
    pub events: StreamReader<Result<SpeechEvent>>,
}

impl SttStream {
    /// Push an audio frame.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the stream input is closed.
    pub async fn push_frame(&mut self, frame: AudioFrame) -> Result<()> {
        self.input.write(SttInput::Frame(frame)).await
    }

    /// Send the flush sentinel.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the stream input is closed.
    pub async fn flush(&mut self) -> Result<()> {
        self.input.write(SttInput::Flush).await
    }

    /// Close the input; the provider finalizes and ends the event stream.
    pub fn end_input(&mut self) {
        self.input.close();
    }

    /// Next recognition event, or `None` at end of stream.
    pub async fn next_event(&mut self) -> Option<Result<SpeechEvent>> {
        self.events.recv().await
    }
}

/// Speech-to-text capability.
#[async_trait]
pub trait Stt: Send + Sync {
    /// Provider label for logs and errors.
    fn label(&self) -> &str;

    /// What this provider supports.
    fn capabilities(&self) -> SttCapabilities;

    /// Open a streaming recognition session.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    async fn stream(&self, options: SttOptions) -> Result<SttStream>;

    /// One-shot recognition of a complete buffer.
    ///
    /// Default implementation streams the buffer through
    /// [`stream`](Self::stream) and returns the last final transcript.
    ///
    /// # Errors
    ///
    /// Returns an error if recognition fails.
    async fn recognize(&self, frame: AudioFrame, options: SttOptions) -> Result<SpeechEvent> {
        let mut stream = self.stream(options).await?;
        stream.push_frame(frame).await?;
        stream.flush().await?;
        stream.end_input();
        let mut last_final = None;
        while let Some(event) = stream.next_event().await {
            let event = event?;
            if event.event_type == SpeechEventType::FinalTranscript {
                last_final = Some(event);
            }
        }
        last_final.ok_or_else(|| crate::error::VoxaError::Recognition {
            label: self.label().to_string(),
            message: "no final transcript produced".into(),
            recoverable: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_text_takes_best_alternative() {
        let event = SpeechEvent {
            event_type: SpeechEventType::FinalTranscript,
            request_id: "r1".into(),
            alternatives: vec![
                SpeechData {
                    text: "best".into(),
                    confidence: 0.9,
                    ..SpeechData::default()
                },
                SpeechData {
                    text: "worse".into(),
                    confidence: 0.2,
                    ..SpeechData::default()
                },
            ],
        };
        assert_eq!(event.text(), Some("best"));
    }

    #[test]
    fn event_without_alternatives_has_no_text() {
        let event = SpeechEvent {
            event_type: SpeechEventType::EndOfSpeech,
            request_id: "r1".into(),
            alternatives: vec![],
        };
        assert!(event.text().is_none());
        assert!(event.language().is_none());
    }
}
