//! Constructor functions for every [`AIEvent`] variant.
//!
//! These are the only way to build an event. Each one stamps the process-wide
//! monotonic timestamp and rejects payloads missing required content.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;
use thiserror::Error;

use super::{AIEvent, AIEventKind, TodoSource, ToolCallInfo};

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Validation failures raised while constructing an event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("assistant message must carry text or tool calls")]
    EmptyAssistantMessage,
    #[error("progress percent {0} is outside 0..=100")]
    PercentOutOfRange(f32),
}

/// Wall-clock milliseconds, bumped so that no two events share a timestamp.
pub fn next_timestamp() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

fn require(value: &str, field: &'static str) -> Result<(), EventError> {
    if value.trim().is_empty() {
        return Err(EventError::EmptyField(field));
    }
    Ok(())
}

pub fn create_session_start(session_id: impl Into<String>) -> Result<AIEvent, EventError> {
    let session_id = session_id.into();
    require(&session_id, "session_id")?;
    Ok(AIEvent::stamped(AIEventKind::SessionStart { session_id }))
}

/// `session_id` may be empty when the engine never reported one; the drain loop
/// fills it with the runtime id before publishing.
pub fn create_session_end(
    session_id: impl Into<String>,
    reason: impl Into<String>,
) -> Result<AIEvent, EventError> {
    let reason = reason.into();
    require(&reason, "reason")?;
    Ok(AIEvent::stamped(AIEventKind::SessionEnd {
        session_id: session_id.into(),
        reason,
    }))
}

pub fn create_user_message(text: impl Into<String>) -> Result<AIEvent, EventError> {
    let text = text.into();
    require(&text, "text")?;
    Ok(AIEvent::stamped(AIEventKind::UserMessage { text }))
}

/// Empty `text` is accepted only alongside at least one tool call.
pub fn create_assistant_message(
    text: impl Into<String>,
    is_delta: bool,
    tool_calls: Vec<ToolCallInfo>,
) -> Result<AIEvent, EventError> {
    let text = text.into();
    if text.is_empty() && tool_calls.is_empty() {
        return Err(EventError::EmptyAssistantMessage);
    }
    Ok(AIEvent::stamped(AIEventKind::AssistantMessage {
        text,
        is_delta,
        tool_calls,
    }))
}

pub fn create_tool_call_start(
    call_id: impl Into<String>,
    name: impl Into<String>,
    args: Value,
) -> Result<AIEvent, EventError> {
    let call_id = call_id.into();
    let name = name.into();
    require(&call_id, "call_id")?;
    require(&name, "name")?;
    Ok(AIEvent::stamped(AIEventKind::ToolCallStart {
        call_id,
        name,
        args,
    }))
}

pub fn create_tool_call_end(
    call_id: impl Into<String>,
    name: impl Into<String>,
    result: Value,
    success: bool,
) -> Result<AIEvent, EventError> {
    let call_id = call_id.into();
    let name = name.into();
    require(&call_id, "call_id")?;
    require(&name, "name")?;
    Ok(AIEvent::stamped(AIEventKind::ToolCallEnd {
        call_id,
        name,
        result,
        success,
    }))
}

pub fn create_progress(
    message: impl Into<String>,
    percent: Option<f32>,
) -> Result<AIEvent, EventError> {
    let message = message.into();
    require(&message, "message")?;
    if let Some(p) = percent {
        if !(0.0..=100.0).contains(&p) {
            return Err(EventError::PercentOutOfRange(p));
        }
    }
    Ok(AIEvent::stamped(AIEventKind::Progress { message, percent }))
}

pub fn create_error(message: impl Into<String>) -> Result<AIEvent, EventError> {
    let message = message.into();
    require(&message, "message")?;
    Ok(AIEvent::stamped(AIEventKind::Error { message }))
}

pub fn create_thinking(text: impl Into<String>) -> Result<AIEvent, EventError> {
    let text = text.into();
    require(&text, "text")?;
    Ok(AIEvent::stamped(AIEventKind::Thinking { text }))
}

pub fn create_token_usage(input_tokens: u64, output_tokens: u64) -> AIEvent {
    AIEvent::stamped(AIEventKind::TokenUsage {
        input_tokens,
        output_tokens,
    })
}

pub fn create_todo_created(
    todo_id: impl Into<String>,
    content: impl Into<String>,
    status: Option<String>,
    source: TodoSource,
) -> Result<AIEvent, EventError> {
    let todo_id = todo_id.into();
    let content = content.into();
    require(&todo_id, "todo_id")?;
    require(&content, "content")?;
    Ok(AIEvent::stamped(AIEventKind::TodoCreated {
        todo_id,
        content,
        status,
        source,
    }))
}

pub fn create_todo_updated(
    todo_id: impl Into<String>,
    content: Option<String>,
    status: Option<String>,
    source: TodoSource,
) -> Result<AIEvent, EventError> {
    let todo_id = todo_id.into();
    require(&todo_id, "todo_id")?;
    Ok(AIEvent::stamped(AIEventKind::TodoUpdated {
        todo_id,
        content,
        status,
        source,
    }))
}

pub fn create_todo_deleted(
    todo_id: impl Into<String>,
    source: TodoSource,
) -> Result<AIEvent, EventError> {
    let todo_id = todo_id.into();
    require(&todo_id, "todo_id")?;
    Ok(AIEvent::stamped(AIEventKind::TodoDeleted { todo_id, source }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ToolCallStatus;
    use serde_json::json;

    fn running_call() -> ToolCallInfo {
        ToolCallInfo {
            id: "toolu_1".into(),
            name: "Read".into(),
            args: json!({"file_path": "/tmp/a"}),
            status: ToolCallStatus::Running,
            result: None,
        }
    }

    #[test]
    fn test_assistant_message_requires_text_or_tool_calls() {
        assert_eq!(
            create_assistant_message("", false, Vec::new()),
            Err(EventError::EmptyAssistantMessage)
        );
        assert!(create_assistant_message("", false, vec![running_call()]).is_ok());
        assert!(create_assistant_message("hello", true, Vec::new()).is_ok());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let a = create_progress("a", None).unwrap();
        let b = create_progress("b", None).unwrap();
        let c = create_token_usage(1, 2);
        assert!(a.timestamp() < b.timestamp());
        assert!(b.timestamp() < c.timestamp());
    }

    #[test]
    fn test_progress_percent_range() {
        assert!(create_progress("half", Some(50.0)).is_ok());
        assert_eq!(
            create_progress("over", Some(120.0)),
            Err(EventError::PercentOutOfRange(120.0))
        );
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(
            create_tool_call_start("", "Read", Value::Null),
            Err(EventError::EmptyField("call_id"))
        );
        assert_eq!(
            create_tool_call_end("id", " ", Value::Null, true),
            Err(EventError::EmptyField("name"))
        );
        assert_eq!(create_error(""), Err(EventError::EmptyField("message")));
        assert_eq!(
            create_todo_created("t1", "", None, TodoSource::Ai),
            Err(EventError::EmptyField("content"))
        );
        assert!(create_session_end("", "completed").is_ok());
        assert!(create_session_start("").is_err());
    }
}
