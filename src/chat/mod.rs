//! Conversation data model.
//!
//! A [`ChatContext`] is an ordered sequence of [`ChatItem`]s — messages,
//! function calls, and function outputs — kept strictly chronological by
//! creation timestamp. The session owns the canonical context; speech
//! handles and tool executions receive immutable snapshots.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Millisecond timestamp that never goes backwards within the process.
///
/// Wall-clock time can step backwards under NTP; chronological insertion
/// depends on monotonic stamps, so each call returns at least 1 ms more
/// than the previous one when the clock stalls or rewinds.
pub fn monotonic_now_ms() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let wall = chrono::Utc::now().timestamp_millis();
    LAST.fetch_max(wall, Ordering::SeqCst);
    LAST.load(Ordering::SeqCst)
}

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// Developer instructions (treated like system for filtering).
    Developer,
    /// The end user.
    User,
    /// The agent.
    Assistant,
}

/// One content part of a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContent {
    /// Plain text.
    Text {
        /// The text body.
        text: String,
    },
    /// An image reference.
    Image {
        /// Image URL.
        url: String,
    },
    /// Audio content represented by its transcript.
    Audio {
        /// Transcript of the audio.
        transcript: String,
    },
}

impl ChatContent {
    /// The textual rendering of this content part.
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::Audio { transcript } => transcript,
            Self::Image { .. } => "",
        }
    }
}

/// A chat message from any role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique item id.
    pub id: String,
    /// Author role.
    pub role: ChatRole,
    /// Ordered content parts.
    pub content: Vec<ChatContent>,
    /// Whether playback of this message was cut short.
    pub interrupted: bool,
    /// Creation timestamp, milliseconds.
    pub created_at: i64,
}

impl ChatMessage {
    /// Create a text message with a fresh id and timestamp.
    pub fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            id: format!("item_{}", Uuid::new_v4().simple()),
            role,
            content: vec![ChatContent::Text { text: text.into() }],
            interrupted: false,
            created_at: monotonic_now_ms(),
        }
    }

    /// Concatenated text of all content parts.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(ChatContent::as_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Unique item id.
    pub id: String,
    /// Correlates this call with its output.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments.
    pub args: String,
    /// Creation timestamp, milliseconds.
    pub created_at: i64,
}

impl FunctionCall {
    /// Create a function call with a fresh item id and timestamp.
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            id: format!("item_{}", Uuid::new_v4().simple()),
            call_id: call_id.into(),
            name: name.into(),
            args: args.into(),
            created_at: monotonic_now_ms(),
        }
    }
}

/// The result of executing a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallOutput {
    /// Unique item id.
    pub id: String,
    /// Matches the originating [`FunctionCall::call_id`].
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Stringified tool output (or error message).
    pub output: String,
    /// Whether the output is an error.
    pub is_error: bool,
    /// Creation timestamp, milliseconds.
    pub created_at: i64,
}

impl FunctionCallOutput {
    /// Create a tool output item with a fresh id and timestamp.
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            id: format!("item_{}", Uuid::new_v4().simple()),
            call_id: call_id.into(),
            name: name.into(),
            output: output.into(),
            is_error,
            created_at: monotonic_now_ms(),
        }
    }
}

/// One entry in a chat context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatItem {
    /// A message.
    Message(ChatMessage),
    /// A tool invocation.
    FunctionCall(FunctionCall),
    /// A tool result.
    FunctionCallOutput(FunctionCallOutput),
}

impl ChatItem {
    /// The item's unique id.
    pub fn id(&self) -> &str {
        match self {
            Self::Message(m) => &m.id,
            Self::FunctionCall(c) => &c.id,
            Self::FunctionCallOutput(o) => &o.id,
        }
    }

    /// The item's creation timestamp.
    pub fn created_at(&self) -> i64 {
        match self {
            Self::Message(m) => m.created_at,
            Self::FunctionCall(c) => c.created_at,
            Self::FunctionCallOutput(o) => o.created_at,
        }
    }

    /// The contained message, if this is one.
    pub fn as_message(&self) -> Option<&ChatMessage> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }
}

/// Filters for [`ChatContext::copy_filtered`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFilter {
    /// Drop function calls and their outputs.
    pub exclude_function_calls: bool,
    /// Drop system / developer messages.
    pub exclude_instructions: bool,
    /// Drop empty messages (no non-empty text content).
    pub exclude_empty_messages: bool,
}

/// An ordered, chronology-preserving sequence of chat items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    items: Vec<ChatItem>,
}

impl ChatContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ordered items.
    pub fn items(&self) -> &[ChatItem] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the context has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert an item at its chronological position.
    ///
    /// Items are ordered by `created_at`; equal timestamps keep insertion
    /// order. Items whose id already exists are ignored (ids are unique
    /// within a context).
    pub fn insert(&mut self, item: ChatItem) {
        if self.items.iter().any(|i| i.id() == item.id()) {
            tracing::warn!(id = item.id(), "duplicate chat item id ignored");
            return;
        }
        let created = item.created_at();
        let pos = self
            .items
            .iter()
            .rposition(|i| i.created_at() <= created)
            .map_or(0, |p| p + 1);
        self.items.insert(pos, item);
    }

    /// Append a message built from role + text, returning its id.
    pub fn add_message(&mut self, role: ChatRole, text: impl Into<String>) -> String {
        let msg = ChatMessage::text(role, text);
        let id = msg.id.clone();
        self.insert(ChatItem::Message(msg));
        id
    }

    /// Find an item by id.
    pub fn get_by_id(&self, id: &str) -> Option<&ChatItem> {
        self.items.iter().find(|i| i.id() == id)
    }

    /// Mutable lookup by id.
    pub fn get_by_id_mut(&mut self, id: &str) -> Option<&mut ChatItem> {
        self.items.iter_mut().find(|i| i.id() == id)
    }

    /// Keep only the most recent `n` items, never dropping the leading
    /// system or developer message.
    pub fn truncate(&mut self, n: usize) {
        if self.items.len() <= n {
            return;
        }
        let leading_instructions = self.items.first().and_then(|item| match item {
            ChatItem::Message(m) if matches!(m.role, ChatRole::System | ChatRole::Developer) => {
                Some(item.clone())
            }
            _ => None,
        });
        let tail_start = self.items.len() - n;
        let mut kept: Vec<ChatItem> = self.items.split_off(tail_start);
        // A function output without its call confuses providers; drop
        // leading orphans produced by the cut.
        while matches!(kept.first(), Some(ChatItem::FunctionCallOutput(_))) {
            kept.remove(0);
        }
        if let Some(instructions) = leading_instructions
            && kept.first().map(ChatItem::id) != Some(instructions.id())
        {
            kept.insert(0, instructions);
        }
        self.items = kept;
    }

    /// Copy the context, applying exclusion filters.
    pub fn copy_filtered(&self, filter: CopyFilter) -> ChatContext {
        let items = self
            .items
            .iter()
            .filter(|item| match item {
                ChatItem::Message(m) => {
                    if filter.exclude_instructions
                        && matches!(m.role, ChatRole::System | ChatRole::Developer)
                    {
                        return false;
                    }
                    if filter.exclude_empty_messages && m.text_content().trim().is_empty() {
                        return false;
                    }
                    true
                }
                ChatItem::FunctionCall(_) | ChatItem::FunctionCallOutput(_) => {
                    !filter.exclude_function_calls
                }
            })
            .cloned()
            .collect();
        ChatContext { items }
    }

    /// Check structural invariants: unique ids, chronological order, and
    /// every function output matching exactly one preceding call.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen_ids = std::collections::HashSet::new();
        let mut call_ids = std::collections::HashSet::new();
        let mut last_created = i64::MIN;
        for item in &self.items {
            if !seen_ids.insert(item.id()) {
                return Err(format!("duplicate item id {}", item.id()));
            }
            if item.created_at() < last_created {
                return Err(format!("item {} breaks chronology", item.id()));
            }
            last_created = item.created_at();
            match item {
                ChatItem::FunctionCall(c) => {
                    if !call_ids.insert(c.call_id.as_str()) {
                        return Err(format!("duplicate call id {}", c.call_id));
                    }
                }
                ChatItem::FunctionCallOutput(o) => {
                    if !call_ids.contains(o.call_id.as_str()) {
                        return Err(format!("output {} has no preceding call", o.call_id));
                    }
                }
                ChatItem::Message(_) => {}
            }
        }
        Ok(())
    }

    /// Serialize to the provider wire shape (`role`/`content` message list
    /// with tool call entries).
    pub fn to_provider_messages(&self) -> serde_json::Value {
        let msgs: Vec<serde_json::Value> = self
            .items
            .iter()
            .map(|item| match item {
                ChatItem::Message(m) => serde_json::json!({
                    "type": "message",
                    "role": m.role,
                    "content": m.text_content(),
                    "interrupted": m.interrupted,
                    "created_at": m.created_at,
                    "id": m.id,
                }),
                ChatItem::FunctionCall(c) => serde_json::json!({
                    "type": "function_call",
                    "id": c.id,
                    "call_id": c.call_id,
                    "name": c.name,
                    "arguments": c.args,
                    "created_at": c.created_at,
                }),
                ChatItem::FunctionCallOutput(o) => serde_json::json!({
                    "type": "function_call_output",
                    "id": o.id,
                    "call_id": o.call_id,
                    "name": o.name,
                    "output": o.output,
                    "is_error": o.is_error,
                    "created_at": o.created_at,
                }),
            })
            .collect();
        serde_json::Value::Array(msgs)
    }

    /// Rebuild a context from [`to_provider_messages`](Self::to_provider_messages)
    /// output. Unknown entry types are skipped.
    pub fn from_provider_messages(value: &serde_json::Value) -> ChatContext {
        let mut ctx = ChatContext::new();
        let Some(entries) = value.as_array() else {
            return ctx;
        };
        for entry in entries {
            let kind = entry.get("type").and_then(|t| t.as_str()).unwrap_or("");
            let created_at = entry
                .get("created_at")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or_else(monotonic_now_ms);
            let id = entry
                .get("id")
                .and_then(|v| v.as_str())
                .map_or_else(|| format!("item_{}", Uuid::new_v4().simple()), String::from);
            match kind {
                "message" => {
                    let role = entry
                        .get("role")
                        .cloned()
                        .and_then(|r| serde_json::from_value(r).ok())
                        .unwrap_or(ChatRole::User);
                    let text = entry
                        .get("content")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default()
                        .to_string();
                    ctx.insert(ChatItem::Message(ChatMessage {
                        id,
                        role,
                        content: vec![ChatContent::Text { text }],
                        interrupted: entry
                            .get("interrupted")
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false),
                        created_at,
                    }));
                }
                "function_call" => {
                    ctx.insert(ChatItem::FunctionCall(FunctionCall {
                        id,
                        call_id: str_field(entry, "call_id"),
                        name: str_field(entry, "name"),
                        args: str_field(entry, "arguments"),
                        created_at,
                    }));
                }
                "function_call_output" => {
                    ctx.insert(ChatItem::FunctionCallOutput(FunctionCallOutput {
                        id,
                        call_id: str_field(entry, "call_id"),
                        name: str_field(entry, "name"),
                        output: str_field(entry, "output"),
                        is_error: entry
                            .get("is_error")
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false),
                        created_at,
                    }));
                }
                _ => {}
            }
        }
        ctx
    }
}

fn str_field(entry: &serde_json::Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
