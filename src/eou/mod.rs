//! End-of-utterance turn detection.
//!
//! A small transformer scores whether the user's turn is complete given the
//! recent conversation. Inference runs out-of-process; the worker relays
//! requests over the job IPC channel, so the detector here only builds the
//! payload and interprets the probability.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::{ChatContext, ChatItem, ChatRole};
use crate::error::{Result, VoxaError};

/// Maximum conversation turns included in the inference payload.
pub const MAX_PAYLOAD_TURNS: usize = 6;

/// IPC inference method for end-of-turn prediction.
pub const EOU_INFERENCE_METHOD: &str = "eou_predict";

/// Probability below which the turn is considered unlikely to be over.
pub const DEFAULT_UNLIKELY_THRESHOLD: f32 = 0.15;

/// Turn-completion predictor.
#[async_trait]
pub trait TurnDetector: Send + Sync {
    /// Probability in [0, 1] that the user's turn is complete.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    async fn predict_end_of_turn(&self, chat_ctx: &ChatContext) -> Result<f32>;

    /// Threshold below which the long endpointing delay applies.
    fn unlikely_threshold(&self, language: Option<&str>) -> Option<f32>;

    /// Whether the model supports the given language.
    fn supports_language(&self, language: Option<&str>) -> bool;
}

/// One `{role, content}` turn of the inference payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EouTurn {
    /// `"user"` or `"assistant"`.
    pub role: String,
    /// Turn text.
    pub content: String,
}

/// Map a chat context to the model's input: the most recent
/// [`MAX_PAYLOAD_TURNS`] user/assistant messages, instructions and tool
/// items filtered out.
pub fn build_eou_payload(chat_ctx: &ChatContext) -> Vec<EouTurn> {
    let mut turns: Vec<EouTurn> = chat_ctx
        .items()
        .iter()
        .filter_map(|item| match item {
            ChatItem::Message(m) => match m.role {
                ChatRole::User => Some(EouTurn {
                    role: "user".into(),
                    content: m.text_content(),
                }),
                ChatRole::Assistant => Some(EouTurn {
                    role: "assistant".into(),
                    content: m.text_content(),
                }),
                ChatRole::System | ChatRole::Developer => None,
            },
            ChatItem::FunctionCall(_) | ChatItem::FunctionCallOutput(_) => None,
        })
        .collect();
    if turns.len() > MAX_PAYLOAD_TURNS {
        turns.drain(..turns.len() - MAX_PAYLOAD_TURNS);
    }
    turns
}

/// Executes inference requests on behalf of in-session components.
///
/// The job process host implements this by relaying `{request_id, method,
/// data}` messages to the parent worker and resolving the matching
/// response.
#[async_trait]
pub trait InferenceRunner: Send + Sync {
    /// Run a named inference method.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay or the remote inference fails.
    async fn infer(&self, method: &str, data: serde_json::Value) -> Result<serde_json::Value>;
}

/// Turn detector backed by an [`InferenceRunner`].
pub struct RemoteTurnDetector {
    runner: Arc<dyn InferenceRunner>,
    unlikely_threshold: f32,
    /// Supported language prefixes (e.g. `"en"`); empty means any.
    languages: Vec<String>,
}

impl RemoteTurnDetector {
    /// Create a detector over the given relay.
    pub fn new(runner: Arc<dyn InferenceRunner>) -> Self {
        Self {
            runner,
            unlikely_threshold: DEFAULT_UNLIKELY_THRESHOLD,
            languages: vec!["en".into()],
        }
    }

    /// Override the unlikely threshold.
    pub fn with_unlikely_threshold(mut self, threshold: f32) -> Self {
        self.unlikely_threshold = threshold;
        self
    }

    /// Override the supported language prefixes. Empty accepts any.
    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }
}

#[async_trait]
impl TurnDetector for RemoteTurnDetector {
    async fn predict_end_of_turn(&self, chat_ctx: &ChatContext) -> Result<f32> {
        let turns = build_eou_payload(chat_ctx);
        let data = serde_json::json!({ "chat_ctx": turns });
        let reply = self.runner.infer(EOU_INFERENCE_METHOD, data).await?;
        let p = reply
            .get("probability")
            .and_then(serde_json::Value::as_f64)
            .or_else(|| reply.as_f64())
            .ok_or_else(|| VoxaError::Session("malformed EOU inference reply".into()))?;
        Ok((p as f32).clamp(0.0, 1.0))
    }

    fn unlikely_threshold(&self, _language: Option<&str>) -> Option<f32> {
        Some(self.unlikely_threshold)
    }

    fn supports_language(&self, language: Option<&str>) -> bool {
        if self.languages.is_empty() {
            return true;
        }
        match language {
            // No language hint yet: let the model try.
            None => true,
            Some(lang) => {
                let lang = lang.to_ascii_lowercase();
                self.languages
                    .iter()
                    .any(|prefix| lang.starts_with(prefix.as_str()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    fn ctx_with(messages: &[(ChatRole, &str)]) -> ChatContext {
        let mut ctx = ChatContext::new();
        for (role, text) in messages {
            let mut m = ChatMessage::text(*role, *text);
            m.created_at = ctx.len() as i64 + 1;
            ctx.insert(ChatItem::Message(m));
        }
        ctx
    }

    #[test]
    fn payload_filters_instructions_and_tools() {
        let mut ctx = ctx_with(&[
            (ChatRole::System, "You are voxa."),
            (ChatRole::User, "hello"),
            (ChatRole::Assistant, "hi there"),
        ]);
        ctx.insert(ChatItem::FunctionCall(crate::chat::FunctionCall::new(
            "c1", "f", "{}",
        )));
        let payload = build_eou_payload(&ctx);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0].role, "user");
        assert_eq!(payload[1].role, "assistant");
    }

    #[test]
    fn payload_keeps_most_recent_six_turns() {
        let messages: Vec<(ChatRole, String)> = (0..10)
            .map(|i| (ChatRole::User, format!("m{i}")))
            .collect();
        let refs: Vec<(ChatRole, &str)> =
            messages.iter().map(|(r, t)| (*r, t.as_str())).collect();
        let ctx = ctx_with(&refs);
        let payload = build_eou_payload(&ctx);
        assert_eq!(payload.len(), MAX_PAYLOAD_TURNS);
        assert_eq!(payload[0].content, "m4");
        assert_eq!(payload[5].content, "m9");
    }

    struct FixedRunner(f64);

    #[async_trait]
    impl InferenceRunner for FixedRunner {
        async fn infer(&self, method: &str, _data: serde_json::Value) -> Result<serde_json::Value> {
            assert_eq!(method, EOU_INFERENCE_METHOD);
            Ok(serde_json::json!({ "probability": self.0 }))
        }
    }

    #[tokio::test]
    async fn remote_detector_parses_probability() {
        let detector = RemoteTurnDetector::new(Arc::new(FixedRunner(0.82)));
        let ctx = ctx_with(&[(ChatRole::User, "are you there")]);
        let p = detector.predict_end_of_turn(&ctx).await.unwrap();
        assert!((p - 0.82).abs() < 1e-6);
    }

    #[test]
    fn language_support_matches_prefixes() {
        let detector = RemoteTurnDetector::new(Arc::new(FixedRunner(0.5)));
        assert!(detector.supports_language(Some("en-US")));
        assert!(detector.supports_language(None));
        assert!(!detector.supports_language(Some("fr-FR")));
    }
}
