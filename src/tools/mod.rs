//! Tool execution: declarative schemas, the run context handed to tools,
//! and the registry the generation pipeline resolves calls against.
//!
//! A tool returns one of three outcomes: a value (appended to the chat
//! context as a function output), an [`AgentHandoff`] (the session swaps
//! the active agent and continues the tool loop), or an error (captured as
//! an error output so the model may recover).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::chat::ChatContext;
use crate::error::{Result, VoxaError};
use crate::session::AgentSession;
use crate::speech::SpeechHandle;

/// A tool definition provided to the LLM for function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name (e.g. `"order_regular_item"`).
    pub name: String,
    /// Human-readable description of the tool's purpose.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Validate a tool parameter schema: the root must be a JSON object schema.
///
/// # Errors
///
/// Returns a tool error for non-object roots.
pub fn validate_parameters_schema(schema: &serde_json::Value) -> Result<()> {
    let is_object_root = schema
        .get("type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| t == "object");
    if !is_object_root {
        return Err(VoxaError::Tool(
            "tool parameter schema root must be an object".into(),
        ));
    }
    Ok(())
}

/// Transfer of the conversation to another agent.
pub struct AgentHandoff {
    /// The agent taking over.
    pub agent: Arc<dyn Agent>,
    /// Text recorded as the tool's output (e.g. "Transferring you now").
    pub returns: Option<String>,
}

/// The result of executing one tool call.
pub enum ToolOutcome {
    /// A plain value, stringified into the function output.
    Value(String),
    /// Swap the active agent and continue.
    Handoff(AgentHandoff),
    /// Execution failed; captured as an error output.
    Error(String),
}

/// Execution context handed to each tool invocation.
pub struct RunContext {
    /// The owning session.
    pub session: AgentSession,
    /// The speech handle driving this tool loop.
    pub speech_handle: SpeechHandle,
    /// Immutable snapshot of the conversation at call time.
    pub chat_ctx: ChatContext,
}

/// A callable tool exposed to the model.
#[async_trait]
pub trait FunctionTool: Send + Sync {
    /// Tool name, unique within a registry.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments (object root).
    fn parameters(&self) -> serde_json::Value;

    /// Execute the tool.
    async fn execute(&self, ctx: &RunContext, args: serde_json::Value) -> ToolOutcome;
}

/// Registry of the tools available to the active agent.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn FunctionTool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a tool list, rejecting invalid schemas.
    ///
    /// # Errors
    ///
    /// Returns a tool error if any tool's parameter schema has a
    /// non-object root.
    pub fn from_tools(tools: Vec<Arc<dyn FunctionTool>>) -> Result<Self> {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Register a tool. Replaces any existing tool with the same name.
    ///
    /// # Errors
    ///
    /// Returns a tool error if the parameter schema root is not an object.
    pub fn register(&mut self, tool: Arc<dyn FunctionTool>) -> Result<()> {
        validate_parameters_schema(&tool.parameters())?;
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionTool>> {
        self.tools.get(name).cloned()
    }

    /// Export sorted definitions for the LLM request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl FunctionTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, _ctx: &RunContext, args: serde_json::Value) -> ToolOutcome {
            let text = args.get("text").and_then(|t| t.as_str()).unwrap_or("");
            ToolOutcome::Value(text.to_string())
        }
    }

    struct BadSchemaTool;

    #[async_trait]
    impl FunctionTool for BadSchemaTool {
        fn name(&self) -> &str {
            "bad"
        }
        fn description(&self) -> &str {
            "Non-object schema"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "type": "string" })
        }
        async fn execute(&self, _ctx: &RunContext, _args: serde_json::Value) -> ToolOutcome {
            ToolOutcome::Value(String::new())
        }
    }

    #[test]
    fn registry_registers_and_looks_up() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn non_object_schema_root_rejected() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(BadSchemaTool)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn definitions_are_sorted() {
        struct Named(&'static str);
        #[async_trait]
        impl FunctionTool for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn description(&self) -> &str {
                "x"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({"type": "object", "properties": {}})
            }
            async fn execute(&self, _ctx: &RunContext, _args: serde_json::Value) -> ToolOutcome {
                ToolOutcome::Value(String::new())
            }
        }
        let registry = ToolRegistry::from_tools(vec![
            Arc::new(Named("zeta")),
            Arc::new(Named("alpha")),
        ])
        .unwrap();
        let defs = registry.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
