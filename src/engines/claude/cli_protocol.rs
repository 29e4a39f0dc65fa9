//! Claude CLI JSON Protocol Types
//!
//! Serde types for the newline-delimited JSON the Claude Code CLI prints with
//! `--print --output-format stream-json --verbose`:
//! - `system` messages for initialization
//! - `assistant` messages containing text, tool_use and thinking blocks
//! - `user` messages carrying tool results
//! - `stream_event` partial-message deltas (with `--include-partial-messages`)
//! - `result` messages marking the end of a turn
//! - `control_request` messages when the CLI needs a permission decision

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Main Event Enum
// ============================================================================

/// Top-level record emitted by the Claude CLI, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    StreamEvent(StreamEventRecord),
    Result(ResultEvent),
    ControlRequest(IncomingControlRequest),
    ControlResponse(Value),

    /// Catch-all for record types added in future CLI versions.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// System Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    /// e.g. "init", "compact_boundary"
    pub subtype: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ============================================================================
// Assistant / User Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// e.g. "end_turn", "tool_use"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    pub message: UserMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: MessageContent,
}

/// User message content is either plain text or a list of blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

// ============================================================================
// Content Blocks
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        thinking: String,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    /// Keeps one unfamiliar block from dropping the whole message.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Partial Message Streaming
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEventRecord {
    pub event: StreamPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    ContentBlockDelta {
        #[serde(default)]
        index: u32,
        delta: BlockDelta,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    /// Tool input fragments; the complete input arrives in the assistant message.
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Result Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    /// "success", "error_max_turns", "error_during_execution", ...
    pub subtype: String,

    #[serde(default)]
    pub is_error: bool,

    #[serde(default)]
    pub is_aborted: bool,

    /// Final text of the turn, or the error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

impl ResultEvent {
    pub fn is_failure(&self) -> bool {
        self.is_error || self.subtype.starts_with("error")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,

    #[serde(default)]
    pub cache_read_input_tokens: u64,

    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl UsageInfo {
    /// Input tokens including cache reads and writes.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

// ============================================================================
// Control Protocol
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingControlRequest {
    pub request_id: String,
    pub request: ControlRequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequestPayload {
    /// "can_use_tool" or "hook_callback"
    pub subtype: String,

    /// Set for `can_use_tool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

impl ControlRequestPayload {
    /// Tool name and input for requests that ask permission to run a tool.
    ///
    /// Hook callbacks nest the tool under `input.tool_name` / `input.tool_input`.
    pub fn permission_target(&self) -> Option<(String, Value)> {
        match self.subtype.as_str() {
            "can_use_tool" => Some((
                self.tool_name.clone()?,
                self.input.clone().unwrap_or(Value::Null),
            )),
            "hook_callback" => {
                let input = self.input.as_ref()?;
                if input.get("hook_event_name").and_then(Value::as_str) != Some("PreToolUse") {
                    return None;
                }
                let name = input.get("tool_name")?.as_str()?.to_string();
                Some((name, input.get("tool_input").cloned().unwrap_or(Value::Null)))
            }
            _ => None,
        }
    }
}
