//! Inference transports for the interruption detector.
//!
//! Two wire options: a plain HTTPS POST per detection window, or a
//! persistent WebSocket session. Both return per-frame probabilities plus
//! the analyzed durations. Authentication is an HS256 bearer token signed
//! from the configured API key and secret.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::InterruptionOptions;
use crate::error::{Result, VoxaError};

type HmacSha256 = Hmac<Sha256>;

/// Endpoint path for both transports.
pub const INTERRUPT_DETECTOR_PATH: &str = "/interrupt-detector";

/// Lifetime of a signed bearer token.
const TOKEN_TTL_SECS: i64 = 3_600;

/// One inference response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResult {
    /// Per-frame interruption probabilities.
    pub probabilities: Vec<f32>,
    /// Seconds of audio analyzed.
    pub total_duration_s: f64,
    /// Seconds of audio the prediction covers.
    pub prediction_duration_s: f64,
}

/// A transport capable of classifying overlap audio.
#[async_trait]
pub trait InterruptionTransport: Send {
    /// Classify a window of mono PCM16 audio.
    ///
    /// # Errors
    ///
    /// Returns a retryable or fatal error per
    /// [`VoxaError::retryable`](crate::error::VoxaError::retryable).
    async fn infer(&mut self, pcm: &[i16], transcript: Option<&str>) -> Result<InferenceResult>;

    /// Propagate updated detection options. Session transports reconnect.
    async fn update_options(&mut self, options: &InterruptionOptions);

    /// Tear down any persistent connection.
    async fn close(&mut self);
}

/// Sign an HS256 bearer token for the detector endpoint.
pub fn sign_bearer_token(api_key: &str, api_secret: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let now = chrono::Utc::now().timestamp();
    let claims = serde_json::json!({
        "iss": api_key,
        "iat": now,
        "exp": now + TOKEN_TTL_SECS,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{header}.{payload}");
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("HMAC-SHA256 key length valid");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{signature}")
}

fn pcm_to_le_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Number of model frames covered by the minimum interruption duration.
pub fn min_frames(options: &InterruptionOptions) -> usize {
    (options.min_interruption_duration_s / super::FRAME_DURATION_S)
        .ceil()
        .max(1.0) as usize
}

// ── HTTP ──────────────────────────────────────────────────────

/// Per-window HTTPS POST transport.
pub struct HttpTransport {
    client: reqwest::Client,
    options: InterruptionOptions,
}

impl HttpTransport {
    /// Create a transport over the configured endpoint.
    pub fn new(options: InterruptionOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            options,
        }
    }
}

#[async_trait]
impl InterruptionTransport for HttpTransport {
    async fn infer(&mut self, pcm: &[i16], _transcript: Option<&str>) -> Result<InferenceResult> {
        let url = format!(
            "{}{INTERRUPT_DETECTOR_PATH}",
            self.options.base_url.trim_end_matches('/')
        );
        let token = sign_bearer_token(&self.options.api_key, &self.options.api_secret);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("content-type", "application/octet-stream")
            .header("x-sample-rate", self.options.sample_rate.to_string())
            .timeout(self.options.conn.timeout())
            .body(bytes::Bytes::from(pcm_to_le_bytes(pcm)))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VoxaError::Timeout(self.options.conn.timeout())
                } else {
                    VoxaError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VoxaError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VoxaError::InterruptionDetection {
                label: "http".into(),
                message: format!("malformed response: {e}"),
                recoverable: true,
            })?;
        Ok(parse_inference_body(&body))
    }

    async fn update_options(&mut self, options: &InterruptionOptions) {
        // Stateless transport: new options apply on the next request.
        self.options = options.clone();
    }

    async fn close(&mut self) {}
}

fn parse_inference_body(body: &serde_json::Value) -> InferenceResult {
    let probabilities = body
        .get("probabilities")
        .and_then(|p| p.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(serde_json::Value::as_f64)
                .map(|p| p as f32)
                .collect()
        })
        .unwrap_or_default();
    InferenceResult {
        probabilities,
        total_duration_s: body
            .get("totalDurationInS")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0),
        prediction_duration_s: body
            .get("predictionDurationInS")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0),
    }
}

// ── WebSocket ─────────────────────────────────────────────────

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Persistent WebSocket session transport.
///
/// The session is created lazily on the first inference and re-created
/// whenever detection options change.
pub struct WsTransport {
    options: InterruptionOptions,
    socket: Option<WsStream>,
    session_id: Option<String>,
}

impl WsTransport {
    /// Create a transport over the configured endpoint.
    pub fn new(options: InterruptionOptions) -> Self {
        Self {
            options,
            socket: None,
            session_id: None,
        }
    }

    fn ws_url(&self) -> String {
        let base = self.options.base_url.trim_end_matches('/');
        let base = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}{INTERRUPT_DETECTOR_PATH}")
    }

    async fn ensure_session(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let url = url::Url::parse(&self.ws_url())
            .map_err(|e| VoxaError::Config(format!("invalid detector URL: {e}")))?;
        let (mut socket, _) = tokio::time::timeout(
            self.options.conn.timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| VoxaError::Timeout(self.options.conn.timeout()))?
        .map_err(|e| VoxaError::Connection(format!("ws connect {url}: {e}")))?;

        let create = serde_json::json!({
            "type": "session.create",
            "sample_rate": self.options.sample_rate,
            "encoding": "pcm_s16le",
            "auth": sign_bearer_token(&self.options.api_key, &self.options.api_secret),
            "extra": {
                "threshold": self.options.threshold,
                "min_frames": min_frames(&self.options),
            },
        });
        socket
            .send(Message::Text(create.to_string().into()))
            .await
            .map_err(|e| VoxaError::Connection(format!("session.create: {e}")))?;

        // Wait for session.created before sending audio.
        loop {
            let msg = tokio::time::timeout(self.options.conn.timeout(), socket.next())
                .await
                .map_err(|_| VoxaError::Timeout(self.options.conn.timeout()))?
                .ok_or_else(|| VoxaError::Connection("ws closed during handshake".into()))?
                .map_err(|e| VoxaError::Connection(e.to_string()))?;
            if let Message::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text)?;
                match value.get("type").and_then(|t| t.as_str()) {
                    Some("session.created") => {
                        self.session_id = value
                            .get("session_id")
                            .and_then(|s| s.as_str())
                            .map(String::from);
                        debug!(session_id = ?self.session_id, "interruption WS session created");
                        break;
                    }
                    Some("error") => {
                        return Err(VoxaError::InterruptionDetection {
                            label: "ws".into(),
                            message: text.to_string(),
                            recoverable: false,
                        });
                    }
                    _ => continue,
                }
            }
        }
        self.socket = Some(socket);
        Ok(())
    }
}

#[async_trait]
impl InterruptionTransport for WsTransport {
    async fn infer(&mut self, pcm: &[i16], transcript: Option<&str>) -> Result<InferenceResult> {
        self.ensure_session().await?;
        let timeout = self.options.conn.timeout();
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| VoxaError::Connection("no ws session".into()))?;

        if let Some(text) = transcript {
            let ctx = serde_json::json!({ "type": "input_transcript", "transcript": text });
            socket
                .send(Message::Text(ctx.to_string().into()))
                .await
                .map_err(|e| VoxaError::Connection(e.to_string()))?;
        }
        socket
            .send(Message::Binary(pcm_to_le_bytes(pcm).into()))
            .await
            .map_err(|e| VoxaError::Connection(e.to_string()))?;

        loop {
            let msg = tokio::time::timeout(timeout, socket.next())
                .await
                .map_err(|_| VoxaError::Timeout(timeout))?
                .ok_or_else(|| VoxaError::Connection("ws closed".into()))?
                .map_err(|e| VoxaError::Connection(e.to_string()))?;
            match msg {
                Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text)?;
                    match value.get("type").and_then(|t| t.as_str()) {
                        Some("output") => return Ok(parse_inference_body(&value)),
                        Some("session.closed") => {
                            self.socket = None;
                            return Err(VoxaError::InterruptionDetection {
                                label: "ws".into(),
                                message: "session closed by server".into(),
                                recoverable: true,
                            });
                        }
                        _ => continue,
                    }
                }
                Message::Close(_) => {
                    self.socket = None;
                    return Err(VoxaError::Connection("ws closed".into()));
                }
                _ => continue,
            }
        }
    }

    async fn update_options(&mut self, options: &InterruptionOptions) {
        let reconnect = (options.threshold - self.options.threshold).abs() > f32::EPSILON
            || (options.min_interruption_duration_s - self.options.min_interruption_duration_s)
                .abs()
                > f64::EPSILON;
        self.options = options.clone();
        if reconnect {
            // Detection options are pinned at session creation; drop the
            // session so the next inference renegotiates.
            self.close().await;
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                warn!("interruption WS close: {e}");
            }
            self.session_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn bearer_token_has_three_segments() {
        let token = sign_bearer_token("key", "secret");
        assert_eq!(token.split('.').count(), 3);
        // Deterministic for a fixed timestamp window: same inputs, same shape.
        let header: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(token.split('.').next().unwrap())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(header["alg"], "HS256");
    }

    #[test]
    fn min_frames_rounds_up() {
        let mut options = InterruptionOptions::default();
        options.min_interruption_duration_s = 0.5;
        // 0.5s / 0.08s per frame = 6.25 → 7 frames.
        assert_eq!(min_frames(&options), 7);
    }

    #[test]
    fn parse_body_handles_missing_fields() {
        let result = parse_inference_body(&serde_json::json!({}));
        assert!(result.probabilities.is_empty());
        assert_eq!(result.total_duration_s, 0.0);
    }

    #[tokio::test]
    async fn http_transport_posts_pcm_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INTERRUPT_DETECTOR_PATH))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "probabilities": [0.1, 0.9, 0.8],
                "totalDurationInS": 1.2,
                "predictionDurationInS": 0.64,
            })))
            .mount(&server)
            .await;

        let mut options = InterruptionOptions::default();
        options.base_url = server.uri();
        options.api_key = "key".into();
        options.api_secret = "secret".into();
        let mut transport = HttpTransport::new(options);

        let result = transport.infer(&[0i16; 160], None).await.unwrap();
        assert_eq!(result.probabilities, vec![0.1, 0.9, 0.8]);
        assert!((result.total_duration_s - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn http_transport_maps_status_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let mut options = InterruptionOptions::default();
        options.base_url = server.uri();
        let mut transport = HttpTransport::new(options);

        let err = transport.infer(&[0i16; 16], None).await.unwrap_err();
        assert!(matches!(err, VoxaError::Status { code: 429, .. }));
        assert!(err.retryable());
    }
}
