//! Shared contract and helpers for per-engine event parsers.
//!
//! A parser turns one raw record (one stdout line, one session-file line, one
//! SSE frame) into zero or more canonical events. Parsers never fail: malformed
//! input and unknown record kinds are logged and produce nothing.

use serde_json::Value;

use super::tool_target::describe_tool_target;
use super::tracker::ToolCallTracker;
use super::types::EngineId;
use crate::events::{
    create_progress, create_tool_call_end, create_tool_call_start, AIEvent, EventError,
    ToolCallInfo,
};

/// Translates one engine's raw records into canonical events.
pub trait EventParser: Send {
    fn engine_id(&self) -> EngineId;

    /// Translates one decoded record.
    fn parse(&mut self, raw: &Value) -> Vec<AIEvent>;

    /// Decodes one raw line and translates it. Blank and malformed lines yield nothing.
    fn parse_line(&mut self, line: &str) -> Vec<AIEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(line) {
            Ok(raw) => self.parse(&raw),
            Err(e) => {
                log::debug!("[{}] skipping malformed line: {}", self.engine_id(), e);
                Vec::new()
            }
        }
    }

    fn tracker(&self) -> &ToolCallTracker;

    /// Clears per-conversation state, including the tool-call tracker.
    fn reset(&mut self);
}

/// Decodes a raw record into an engine's closed event enum, logging failures.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(engine: EngineId, raw: &Value) -> Option<T> {
    match serde_json::from_value::<T>(raw.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            let kind = raw.get("type").and_then(Value::as_str).unwrap_or("<untyped>");
            log::debug!("[{engine}] could not decode {kind} record: {e}");
            None
        }
    }
}

/// Appends a constructed event, dropping (and logging) payloads that failed validation.
pub(crate) fn push(out: &mut Vec<AIEvent>, event: Result<AIEvent, EventError>) {
    match event {
        Ok(event) => out.push(event),
        Err(e) => log::debug!("[parser] dropped invalid event: {e}"),
    }
}

/// Registers a tool call and returns its start event. A missing id gets a fresh one.
pub(crate) fn begin_tool_call(
    tracker: &mut ToolCallTracker,
    name: &str,
    id: Option<&str>,
    args: Value,
) -> Result<(ToolCallInfo, AIEvent), EventError> {
    let id = match id.filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => format!("call_{}", uuid::Uuid::new_v4().simple()),
    };
    let event = create_tool_call_start(&id, name, args.clone())?;
    let info = tracker.start_tool_call(name, id, args);
    Ok((info, event))
}

/// Resolves a tool completion against the tracker and builds its end event.
///
/// * With an id: the tracked call is completed. An id the tracker never saw still
///   yields an event (named `unknown` unless the backend supplied a name); a second
///   completion of an already finished call yields nothing.
/// * Without an id: the oldest running call with the same name is completed. When
///   none matches, the event carries a placeholder id that is not tracked.
pub(crate) fn finish_tool_call(
    tracker: &mut ToolCallTracker,
    id: Option<&str>,
    name: Option<&str>,
    result: Value,
    success: bool,
) -> Option<AIEvent> {
    let id = match id.filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => {
            let name = name.unwrap_or("unknown");
            match tracker.find_running_by_name(name) {
                Some(call) => call.id.clone(),
                None => {
                    log::debug!("[tracker] no running call named {name}, synthesizing id");
                    let placeholder = format!("call_{}", uuid::Uuid::new_v4().simple());
                    return create_tool_call_end(placeholder, name, result, success).ok();
                }
            }
        }
    };

    let tracked = tracker.get(&id).map(|c| (c.name.clone(), c.status.is_terminal()));
    match tracked {
        Some((_, true)) => {
            log::debug!("[tracker] ignoring duplicate completion for {id}");
            None
        }
        Some((tracked_name, false)) => {
            tracker.end_tool_call(&id, result.clone(), success);
            create_tool_call_end(id, tracked_name, result, success).ok()
        }
        None => {
            log::debug!("[tracker] completion for untracked call {id}");
            create_tool_call_end(id, name.unwrap_or("unknown"), result, success).ok()
        }
    }
}

/// Progress event standing in for a permission prompt.
pub(crate) fn permission_progress(tool_name: &str, input: &Value) -> Result<AIEvent, EventError> {
    let target = describe_tool_target(tool_name, input);
    let message = if target == tool_name {
        format!("Waiting for permission: {tool_name}")
    } else {
        format!("Waiting for permission: {tool_name} ({target})")
    };
    create_progress(message, None)
}

/// Flattens tool result content (string, text blocks, or arbitrary JSON) to text.
pub(crate) fn flatten_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => other.get("text").and_then(Value::as_str).map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
