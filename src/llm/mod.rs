//! Language-model capability contract.
//!
//! Providers normalize their streaming APIs into [`ChatChunk`] deltas — text
//! content, tool calls, and a terminal usage chunk. A stream cannot be
//! restarted; each turn creates a new one. Mid-stream cancellation is
//! supported via the stream's cancellation token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatContext, ChatRole, FunctionCall};
use crate::config::ConnOptions;
use crate::error::Result;
use crate::sync::chan::StreamReader;
use crate::tools::ToolDefinition;

/// How the model may use tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides.
    #[default]
    Auto,
    /// Tools disabled for this request.
    None,
    /// Model must call some tool.
    Required,
    /// Model must call the named tool.
    Named(String),
}

/// Token accounting reported at end of stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
}

/// Incremental model output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChoiceDelta {
    /// Role, present on the first delta.
    pub role: Option<ChatRole>,
    /// Text fragment.
    pub content: Option<String>,
    /// Completed tool calls in this delta.
    pub tool_calls: Vec<FunctionCall>,
}

/// One streamed chunk from the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatChunk {
    /// Provider request id.
    pub id: String,
    /// Incremental output, absent on the terminal usage chunk.
    pub delta: Option<ChoiceDelta>,
    /// Usage, present only on the terminal chunk.
    pub usage: Option<CompletionUsage>,
}

/// A chat completion request.
#[derive(Clone)]
pub struct ChatRequest {
    /// Conversation history snapshot.
    pub chat_ctx: ChatContext,
    /// Tools available to the model.
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice constraint.
    pub tool_choice: ToolChoice,
    /// Allow multiple tool calls per response. `None` leaves the provider
    /// default in place.
    pub parallel_tool_calls: Option<bool>,
    /// Transport options.
    pub conn: ConnOptions,
    /// Provider-specific extra parameters.
    pub extra: serde_json::Value,
}

impl ChatRequest {
    /// A request with defaults over the given context.
    pub fn new(chat_ctx: ChatContext) -> Self {
        Self {
            chat_ctx,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            parallel_tool_calls: None,
            conn: ConnOptions::default(),
            extra: serde_json::Value::Null,
        }
    }
}

/// What an LLM implementation supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmCapabilities {
    /// The provider can execute multiple tool calls in one step.
    pub parallel_tool_calls: bool,
}

/// A live completion stream.
///
/// Dropping the stream or calling [`cancel`](Self::cancel) aborts the
/// underlying request at the provider.
pub struct LlmStream {
    chunks: StreamReader<Result<ChatChunk>>,
    cancel: CancellationToken,
}

impl LlmStream {
    /// Wrap a provider's chunk stream with its cancellation token.
    pub fn new(chunks: StreamReader<Result<ChatChunk>>, cancel: CancellationToken) -> Self {
        Self { chunks, cancel }
    }

    /// Next chunk, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<ChatChunk>> {
        self.chunks.recv().await
    }

    /// Abort the request mid-stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The stream's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for LlmStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Language-model capability.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Provider label for logs and errors.
    fn label(&self) -> &str;

    /// What this provider supports.
    fn capabilities(&self) -> LlmCapabilities {
        LlmCapabilities::default()
    }

    /// Start a streaming completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be initiated; stream-level
    /// failures are delivered as `Err` items on the stream.
    async fn chat(&self, request: ChatRequest) -> Result<LlmStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::chan::stream_channel;

    #[tokio::test]
    async fn stream_yields_chunks_then_ends() {
        let (mut tx, rx) = stream_channel();
        let cancel = CancellationToken::new();
        let mut stream = LlmStream::new(rx, cancel);
        tx.write(Ok(ChatChunk {
            id: "r1".into(),
            delta: Some(ChoiceDelta {
                content: Some("hi".into()),
                ..ChoiceDelta::default()
            }),
            usage: None,
        }))
        .await
        .unwrap();
        tx.close();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta.unwrap().content.as_deref(), Some("hi"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn drop_cancels_request() {
        let (_tx, rx) = stream_channel::<Result<ChatChunk>>();
        let cancel = CancellationToken::new();
        let observed = cancel.clone();
        drop(LlmStream::new(rx, cancel));
        assert!(observed.is_cancelled());
    }

    #[test]
    fn tool_choice_serializes_snake_case() {
        let json = serde_json::to_string(&ToolChoice::Required).unwrap();
        assert_eq!(json, "\"required\"");
    }
}
