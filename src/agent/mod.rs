//! The agent contract and sub-conversation tasks.
//!
//! An [`Agent`] supplies instructions, tools, optional per-agent capability
//! overrides, and lifecycle hooks. An [`AgentTask`] drives a nested
//! sub-conversation (e.g. collecting a caller's name before the main flow)
//! and restores the previous agent when it completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::chat::{ChatContext, ChatMessage};
use crate::eou::TurnDetector;
use crate::error::{Result, VoxaError};
use crate::llm::Llm;
use crate::session::AgentSession;
use crate::stt::Stt;
use crate::sync::promise::Promise;
use crate::tools::FunctionTool;
use crate::tts::Tts;
use crate::vad::Vad;

/// Control-flow signal from [`Agent::on_user_turn_completed`]: commit the
/// user turn but do not generate a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopResponse;

/// A conversational agent hosted by a session.
///
/// Capability accessors return `None` to inherit the session's defaults.
#[async_trait]
pub trait Agent: Send + Sync {
    /// System instructions for this agent.
    fn instructions(&self) -> String;

    /// Tools exposed to the model while this agent is active.
    fn tools(&self) -> Vec<Arc<dyn FunctionTool>> {
        Vec::new()
    }

    /// Per-agent STT override.
    fn stt(&self) -> Option<Arc<dyn Stt>> {
        None
    }

    /// Per-agent LLM override.
    fn llm(&self) -> Option<Arc<dyn Llm>> {
        None
    }

    /// Per-agent TTS override.
    fn tts(&self) -> Option<Arc<dyn Tts>> {
        None
    }

    /// Per-agent VAD override.
    fn vad(&self) -> Option<Arc<dyn Vad>> {
        None
    }

    /// Per-agent turn-detector override.
    fn turn_detection(&self) -> Option<Arc<dyn TurnDetector>> {
        None
    }

    /// Called when this agent becomes active.
    async fn on_enter(&self, _session: &AgentSession) {}

    /// Called when this agent is deactivated (handoff or close).
    async fn on_exit(&self, _session: &AgentSession) {}

    /// Called when a user turn commits, before the reply is scheduled.
    /// The context may be mutated; returning `Err(StopResponse)` suppresses
    /// the reply.
    ///
    /// # Errors
    ///
    /// `StopResponse` is control flow, not a failure.
    async fn on_user_turn_completed(
        &self,
        _chat_ctx: &mut ChatContext,
        _new_message: &ChatMessage,
    ) -> std::result::Result<(), StopResponse> {
        Ok(())
    }
}

/// A plain agent configured from data, for simple deployments and tests.
pub struct StaticAgent {
    instructions: String,
    tools: Vec<Arc<dyn FunctionTool>>,
}

impl StaticAgent {
    /// Create an agent with instructions only.
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            tools: Vec::new(),
        }
    }

    /// Attach tools.
    pub fn with_tools(mut self, tools: Vec<Arc<dyn FunctionTool>>) -> Self {
        self.tools = tools;
        self
    }
}

#[async_trait]
impl Agent for StaticAgent {
    fn instructions(&self) -> String {
        self.instructions.clone()
    }

    fn tools(&self) -> Vec<Arc<dyn FunctionTool>> {
        self.tools.clone()
    }
}

/// A nested sub-conversation driven by its own agent.
///
/// `run` activates the task's agent, waits for [`complete`](Self::complete),
/// then restores the previously active agent. A task instance is
/// single-shot.
pub struct AgentTask {
    agent: Arc<dyn Agent>,
    ran: AtomicBool,
    completion: Promise<serde_json::Value>,
}

impl AgentTask {
    /// Create a task around the nested agent.
    pub fn new(agent: Arc<dyn Agent>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            ran: AtomicBool::new(false),
            completion: Promise::new(),
        })
    }

    /// Complete the task with a result value. Idempotent; the first value
    /// wins.
    pub fn complete(&self, value: serde_json::Value) {
        self.completion.resolve(value);
    }

    /// Whether the task has completed.
    pub fn is_complete(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Run the sub-conversation on the session and return its result.
    ///
    /// The activity lock is *not* held while awaiting completion — holding
    /// it would deadlock a handoff that re-enters the session.
    ///
    /// # Errors
    ///
    /// Fails if the task was already run ("cannot be awaited multiple
    /// times") or if swapping agents fails.
    pub async fn run(&self, session: &AgentSession) -> Result<serde_json::Value> {
        if self.ran.swap(true, Ordering::SeqCst) {
            return Err(VoxaError::Session(
                "AgentTask cannot be awaited multiple times".into(),
            ));
        }
        let previous = session.current_agent();
        session.update_agent(Arc::clone(&self.agent)).await;
        let value = self.completion.wait().await;
        session.update_agent(previous).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_agent_exposes_instructions() {
        let agent = StaticAgent::new("You are a test agent.");
        assert_eq!(agent.instructions(), "You are a test agent.");
        assert!(agent.tools().is_empty());
        assert!(agent.llm().is_none());
    }

    #[test]
    fn agent_task_complete_is_idempotent() {
        let task = AgentTask::new(Arc::new(StaticAgent::new("nested")));
        task.complete(serde_json::json!({"name": "Sam"}));
        task.complete(serde_json::json!({"name": "Other"}));
        assert!(task.is_complete());
    }
}
