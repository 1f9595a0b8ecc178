//! Configuration types for the voice-agent runtime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxaError};

/// Ceiling for exponential retry backoff.
pub const RETRY_INTERVAL_CAP: Duration = Duration::from_secs(10);

/// Per-call connection options shared by every provider transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnOptions {
    /// Per-call deadline in milliseconds.
    pub timeout_ms: u64,
    /// Maximum retry attempts for retryable errors.
    pub max_retry: u32,
    /// Base retry interval in milliseconds.
    pub retry_interval_ms: u64,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retry: 3,
            retry_interval_ms: 500,
        }
    }
}

impl ConnOptions {
    /// The per-call deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before retry attempt `i` (0-based): `base × 2^i`, capped.
    pub fn interval_for_retry(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.retry_interval_ms);
        let scaled = base.saturating_mul(2u32.saturating_pow(attempt));
        scaled.min(RETRY_INTERVAL_CAP)
    }
}

/// Endpointing and turn-taking options for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceOptions {
    /// Whether the user may interrupt agent speech.
    pub allow_interruptions: bool,
    /// Endpointing delay when the turn detector considers the turn complete.
    pub min_endpointing_delay_ms: u64,
    /// Endpointing delay when the turn detector considers more speech likely.
    pub max_endpointing_delay_ms: u64,
    /// Start LLM generation from preflight transcripts before commitment.
    pub preemptive_generation: bool,
    /// Maximum chained tool-call steps per speech handle.
    pub max_tool_steps: usize,
    /// Execute multiple tool calls concurrently when the model supports it.
    pub parallel_tool_calls: bool,
    /// Relative speech rate for transcript pacing (1.0 = standard).
    pub user_speed: f64,
    /// Forward TTS-provided aligned text instead of paced LLM text when
    /// the provider exposes per-chunk timings.
    pub use_tts_aligned_transcript: bool,
    /// Manual turn-taking: end-of-turn only on `commit_user_turn`.
    pub manual_turn_detection: bool,
    /// Drain the active speech handle before closing the session.
    pub drain_on_close: bool,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            min_endpointing_delay_ms: 500,
            max_endpointing_delay_ms: 6_000,
            preemptive_generation: false,
            max_tool_steps: 3,
            parallel_tool_calls: false,
            user_speed: 1.0,
            use_tts_aligned_transcript: false,
            manual_turn_detection: false,
            drain_on_close: true,
        }
    }
}

impl VoiceOptions {
    /// Endpointing delay for a likely-complete turn.
    pub fn min_endpointing_delay(&self) -> Duration {
        Duration::from_millis(self.min_endpointing_delay_ms)
    }

    /// Endpointing delay for a likely-incomplete turn.
    pub fn max_endpointing_delay(&self) -> Duration {
        Duration::from_millis(self.max_endpointing_delay_ms)
    }
}

/// Voice activity detection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadOptions {
    /// Minimum speech run to report a start of speech.
    pub min_speech_duration_ms: u64,
    /// Silence run that ends a speech segment.
    pub min_silence_duration_ms: u64,
    /// Audio retained before the detected start of speech.
    pub prefix_padding_ms: u64,
    /// Cap on buffered speech frames per segment.
    pub max_buffered_speech_ms: u64,
    /// Smoothed-probability threshold for speech.
    pub activation_threshold: f32,
    /// Expected input sample rate.
    pub sample_rate: u32,
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            min_speech_duration_ms: 50,
            min_silence_duration_ms: 550,
            prefix_padding_ms: 500,
            max_buffered_speech_ms: 60_000,
            activation_threshold: 0.5,
            sample_rate: 16_000,
        }
    }
}

/// Remote interruption-detector options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionOptions {
    /// Inference endpoint base URL.
    pub base_url: String,
    /// API key for the bearer token.
    pub api_key: String,
    /// API secret for the bearer token.
    pub api_secret: String,
    /// Model input sample rate.
    pub sample_rate: u32,
    /// Probability above which overlap speech is an interruption.
    pub threshold: f32,
    /// Interruptions shorter than this are ignored.
    pub min_interruption_duration_s: f64,
    /// Audio context included before the overlap start.
    pub audio_prefix_duration_s: f64,
    /// Ring-buffer capacity in seconds.
    pub max_audio_duration_s: f64,
    /// Inference cadence during overlap.
    pub detection_interval_s: f64,
    /// Use the persistent WebSocket transport instead of per-window HTTP.
    pub use_websocket: bool,
    /// Transport connection options.
    pub conn: ConnOptions,
}

impl Default for InterruptionOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            sample_rate: 16_000,
            threshold: 0.5,
            min_interruption_duration_s: 0.5,
            audio_prefix_duration_s: 2.0,
            max_audio_duration_s: 10.0,
            detection_interval_s: 0.32,
            use_websocket: false,
            conn: ConnOptions::default(),
        }
    }
}

/// Worker-level options: media server connection and process lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Media server URL.
    pub url: String,
    /// Media server API key.
    pub api_key: String,
    /// Media server API secret.
    pub api_secret: String,
}

/// Top-level configuration for a voxa worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxaConfig {
    /// Media server connection.
    pub worker: WorkerOptions,
    /// Turn-taking and endpointing defaults for new sessions.
    pub voice: VoiceOptions,
    /// Voice activity detection defaults.
    pub vad: VadOptions,
    /// Interruption detector defaults.
    pub interruption: InterruptionOptions,
}

impl VoxaConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a config error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| VoxaError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| VoxaError::Config(format!("invalid TOML: {e}")))
    }

    /// Apply `LIVEKIT_URL` / `LIVEKIT_API_KEY` / `LIVEKIT_API_SECRET`
    /// environment overrides.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("LIVEKIT_URL") {
            self.worker.url = url;
        }
        if let Ok(key) = std::env::var("LIVEKIT_API_KEY") {
            self.worker.api_key = key;
        }
        if let Ok(secret) = std::env::var("LIVEKIT_API_SECRET") {
            self.worker.api_secret = secret;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_interval_doubles_and_caps() {
        let conn = ConnOptions {
            retry_interval_ms: 500,
            ..ConnOptions::default()
        };
        assert_eq!(conn.interval_for_retry(0), Duration::from_millis(500));
        assert_eq!(conn.interval_for_retry(1), Duration::from_millis(1_000));
        assert_eq!(conn.interval_for_retry(2), Duration::from_millis(2_000));
        assert_eq!(conn.interval_for_retry(10), RETRY_INTERVAL_CAP);
    }

    #[test]
    fn defaults_are_sane() {
        let opts = VoiceOptions::default();
        assert!(opts.min_endpointing_delay() < opts.max_endpointing_delay());
        assert!(opts.allow_interruptions);
        assert_eq!(opts.max_tool_steps, 3);
    }

    #[test]
    fn config_parses_partial_toml() {
        let cfg: VoxaConfig = toml::from_str(
            r#"
            [voice]
            preemptive_generation = true

            [interruption]
            threshold = 0.7
            "#,
        )
        .unwrap();
        assert!(cfg.voice.preemptive_generation);
        assert!((cfg.interruption.threshold - 0.7).abs() < f32::EPSILON);
        // Unspecified sections fall back to defaults.
        assert_eq!(cfg.vad.sample_rate, 16_000);
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voxa.toml");
        std::fs::write(&path, "[voice]\nmax_tool_steps = 5\n").unwrap();
        let cfg = VoxaConfig::from_file(&path).unwrap();
        assert_eq!(cfg.voice.max_tool_steps, 5);
    }
}
