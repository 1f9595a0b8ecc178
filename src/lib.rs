//! voxa: server-side runtime for real-time conversational voice agents.
//!
//! A worker process hosts many concurrent jobs. Each job joins a media room,
//! receives the end user's microphone audio, runs a
//! {STT → LLM → tools → TTS → playback} pipeline, and publishes synthesized
//! audio back into the room. Turn-taking — deciding when the user has
//! finished speaking and when the agent may speak or be interrupted — is
//! coordinated by the [`session::AgentSession`] state machine, fed by the
//! [`recognition::AudioRecognition`] coordinator and, during overlapping
//! speech, the [`interruption::InterruptionDetector`].
//!
//! Layering (leaves first):
//!
//! - [`sync`] / [`audio`] — backpressured channels, cancellable tasks,
//!   bounded caches, PCM utilities.
//! - [`stt`] / [`llm`] / [`tts`] / [`vad`] / [`eou`] — abstract capability
//!   contracts for providers.
//! - [`interruption`] — remote overlap-speech classifier (C5).
//! - [`recognition`] — VAD + STT + end-of-utterance fusion (C1).
//! - [`transcription`] — paces forwarded text to the audio timeline (C4).
//! - [`speech`] — one in-flight agent utterance and its pipeline (C3).
//! - [`session`] — the turn-taking scheduler (C2).
//! - [`job`] — worker process host and inference IPC (C8).

pub mod agent;
pub mod audio;
pub mod chat;
pub mod config;
pub mod eou;
pub mod error;
pub mod interruption;
pub mod job;
pub mod llm;
pub mod recognition;
pub mod room;
pub mod session;
pub mod speech;
pub mod stt;
pub mod sync;
pub mod test_utils;
pub mod text;
pub mod tools;
pub mod transcription;
pub mod tts;
pub mod vad;

pub use config::VoxaConfig;
pub use error::{Result, VoxaError};
pub use session::{AgentSession, SessionEvent};
pub use speech::SpeechHandle;
