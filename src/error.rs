//! Error types for the voxa runtime.

use std::time::Duration;

/// Top-level error type for the voice-agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum VoxaError {
    /// TCP / TLS / WebSocket open failure, DNS failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// A per-call deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An HTTP status outside 2xx.
    #[error("status {code}: {message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Speech recognition failure.
    #[error("recognition error ({label}): {message}")]
    Recognition {
        /// Provider or stage label.
        label: String,
        /// Failure description.
        message: String,
        /// Whether the stream may reconnect and continue.
        recoverable: bool,
    },

    /// Overlap-speech classification failure.
    #[error("interruption detection error ({label}): {message}")]
    InterruptionDetection {
        /// Provider or stage label.
        label: String,
        /// Failure description.
        message: String,
        /// Whether the transport may reconnect and continue.
        recoverable: bool,
    },

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Tool execution failure surfaced to the model.
    #[error("tool error: {0}")]
    Tool(String),

    /// A write to a closed stream channel.
    #[error("channel error: {0}")]
    Channel(String),

    /// A cancellable task was aborted at a suspension point.
    #[error("task aborted")]
    Aborted,

    /// Session state machine invariant violated.
    #[error("session error: {0}")]
    Session(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoxaError {
    /// Whether retrying the failed call may succeed.
    ///
    /// Connection and timeout failures retry. HTTP 429 and 5xx retry;
    /// other 4xx do not. Recognition and interruption-detection errors
    /// retry only when the provider marked them recoverable.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            Self::Recognition { recoverable, .. }
            | Self::InterruptionDetection { recoverable, .. } => *recoverable,
            _ => false,
        }
    }

    /// Whether this error is the distinguished cooperative-cancellation error.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoxaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_timeout_are_retryable() {
        assert!(VoxaError::Connection("refused".into()).retryable());
        assert!(VoxaError::Timeout(Duration::from_secs(5)).retryable());
    }

    #[test]
    fn status_retryability_follows_code() {
        let rate_limited = VoxaError::Status {
            code: 429,
            message: "slow down".into(),
        };
        let bad_gateway = VoxaError::Status {
            code: 502,
            message: "bad gateway".into(),
        };
        let unauthorized = VoxaError::Status {
            code: 401,
            message: "bad key".into(),
        };
        assert!(rate_limited.retryable());
        assert!(bad_gateway.retryable());
        assert!(!unauthorized.retryable());
    }

    #[test]
    fn recognition_respects_recoverable_flag() {
        let soft = VoxaError::Recognition {
            label: "stt".into(),
            message: "socket closed".into(),
            recoverable: true,
        };
        let hard = VoxaError::Recognition {
            label: "stt".into(),
            message: "invalid model".into(),
            recoverable: false,
        };
        assert!(soft.retryable());
        assert!(!hard.retryable());
    }

    #[test]
    fn aborted_is_distinguished() {
        assert!(VoxaError::Aborted.is_aborted());
        assert!(!VoxaError::Llm("x".into()).is_aborted());
    }
}
