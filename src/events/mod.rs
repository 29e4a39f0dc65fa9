//! Canonical event model.
//!
//! Every engine parser normalizes its wire format into [`AIEvent`], and every
//! consumer (chat view, inspector, todo sync) only ever sees this type. Events are
//! built through the constructor functions in [`constructors`], which stamp the
//! timestamp and validate required fields; the envelope fields are private so a
//! published event cannot be altered afterwards.

mod constructors;

pub use constructors::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Supporting types
// ============================================================================

/// Who caused a todo mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoSource {
    User,
    Ai,
    System,
}

impl std::fmt::Display for TodoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TodoSource::User => write!(f, "user"),
            TodoSource::Ai => write!(f, "ai"),
            TodoSource::System => write!(f, "system"),
        }
    }
}

/// Lifecycle of a tracked tool invocation.
///
/// Transitions only move forward: `pending -> running -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ToolCallStatus::Pending => 0,
            ToolCallStatus::Running => 1,
            ToolCallStatus::Completed | ToolCallStatus::Failed => 2,
        }
    }

    pub fn can_transition_to(self, next: ToolCallStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// One in-flight or finished tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

// ============================================================================
// Event payloads
// ============================================================================

/// Discriminant of an [`AIEventKind`], used as the subscription key on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AIEventType {
    SessionStart,
    SessionEnd,
    UserMessage,
    AssistantMessage,
    ToolCallStart,
    ToolCallEnd,
    Progress,
    Error,
    Thinking,
    TokenUsage,
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
}

impl AIEventType {
    pub const ALL: [AIEventType; 13] = [
        AIEventType::SessionStart,
        AIEventType::SessionEnd,
        AIEventType::UserMessage,
        AIEventType::AssistantMessage,
        AIEventType::ToolCallStart,
        AIEventType::ToolCallEnd,
        AIEventType::Progress,
        AIEventType::Error,
        AIEventType::Thinking,
        AIEventType::TokenUsage,
        AIEventType::TodoCreated,
        AIEventType::TodoUpdated,
        AIEventType::TodoDeleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AIEventType::SessionStart => "session_start",
            AIEventType::SessionEnd => "session_end",
            AIEventType::UserMessage => "user_message",
            AIEventType::AssistantMessage => "assistant_message",
            AIEventType::ToolCallStart => "tool_call_start",
            AIEventType::ToolCallEnd => "tool_call_end",
            AIEventType::Progress => "progress",
            AIEventType::Error => "error",
            AIEventType::Thinking => "thinking",
            AIEventType::TokenUsage => "token_usage",
            AIEventType::TodoCreated => "todo_created",
            AIEventType::TodoUpdated => "todo_updated",
            AIEventType::TodoDeleted => "todo_deleted",
        }
    }
}

impl std::fmt::Display for AIEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of canonical event payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AIEventKind {
    /// The backend announced a conversation. `session_id` is the id the engine
    /// itself uses (the handle for resuming), falling back to the runtime id.
    SessionStart { session_id: String },

    /// The task finished. Reasons include `completed`, `aborted` and `disposed`.
    SessionEnd { session_id: String, reason: String },

    UserMessage { text: String },

    /// Complete or incremental assistant output. A message always carries text,
    /// tool calls, or both.
    AssistantMessage {
        text: String,
        is_delta: bool,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallInfo>,
    },

    ToolCallStart {
        call_id: String,
        name: String,
        args: Value,
    },

    ToolCallEnd {
        call_id: String,
        name: String,
        result: Value,
        success: bool,
    },

    Progress {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f32>,
    },

    Error { message: String },

    /// Extended-thinking content.
    Thinking { text: String },

    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
    },

    TodoCreated {
        todo_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        source: TodoSource,
    },

    TodoUpdated {
        todo_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        source: TodoSource,
    },

    TodoDeleted { todo_id: String, source: TodoSource },
}

impl AIEventKind {
    pub fn event_type(&self) -> AIEventType {
        match self {
            AIEventKind::SessionStart { .. } => AIEventType::SessionStart,
            AIEventKind::SessionEnd { .. } => AIEventType::SessionEnd,
            AIEventKind::UserMessage { .. } => AIEventType::UserMessage,
            AIEventKind::AssistantMessage { .. } => AIEventType::AssistantMessage,
            AIEventKind::ToolCallStart { .. } => AIEventType::ToolCallStart,
            AIEventKind::ToolCallEnd { .. } => AIEventType::ToolCallEnd,
            AIEventKind::Progress { .. } => AIEventType::Progress,
            AIEventKind::Error { .. } => AIEventType::Error,
            AIEventKind::Thinking { .. } => AIEventType::Thinking,
            AIEventKind::TokenUsage { .. } => AIEventType::TokenUsage,
            AIEventKind::TodoCreated { .. } => AIEventType::TodoCreated,
            AIEventKind::TodoUpdated { .. } => AIEventType::TodoUpdated,
            AIEventKind::TodoDeleted { .. } => AIEventType::TodoDeleted,
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A canonical event: payload plus the timestamp assigned at construction and
/// the runtime session that published it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AIEvent {
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
    #[serde(flatten)]
    kind: AIEventKind,
}

impl AIEvent {
    pub(crate) fn stamped(kind: AIEventKind) -> Self {
        Self {
            timestamp: next_timestamp(),
            origin: None,
            kind,
        }
    }

    /// Milliseconds since the Unix epoch, strictly increasing across the process.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Runtime session id of the session that published this event, if any.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn kind(&self) -> &AIEventKind {
        &self.kind
    }

    pub fn event_type(&self) -> AIEventType {
        self.kind.event_type()
    }

    /// Whether this event ends the task that produced it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            AIEventKind::SessionEnd { .. } | AIEventKind::Error { .. }
        )
    }

    /// Attaches the publishing session before the event leaves the drain loop.
    ///
    /// Session start/end events whose engine id is unknown inherit the runtime id.
    pub fn with_origin(mut self, session_id: &str) -> Self {
        match &mut self.kind {
            AIEventKind::SessionStart { session_id: id }
            | AIEventKind::SessionEnd { session_id: id, .. }
                if id.is_empty() =>
            {
                *id = session_id.to_string();
            }
            _ => {}
        }
        self.origin = Some(session_id.to_string());
        self
    }
}
