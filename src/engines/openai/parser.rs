//! Translates OpenAI-compatible SSE frames into canonical events.

use serde_json::Value;
use std::collections::BTreeMap;

use super::protocol::{ChunkChoice, StreamChunk};
use crate::engines::parser::{begin_tool_call, decode, push, EventParser};
use crate::engines::tracker::ToolCallTracker;
use crate::engines::types::EngineId;
use crate::events::{
    create_assistant_message, create_error, create_session_end, create_session_start,
    create_thinking, create_token_usage, AIEvent,
};

/// Tool call assembled from streamed fragments.
#[derive(Debug, Default, Clone)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl PendingCall {
    fn args(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(Default::default());
        }
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| Value::String(self.arguments.clone()))
    }
}

#[derive(Debug, Default)]
pub struct OpenAiParser {
    tracker: ToolCallTracker,
    stream_id: Option<String>,
    pending: BTreeMap<usize, PendingCall>,
    finished: bool,
}

impl OpenAiParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_id(&self) -> String {
        self.stream_id.clone().unwrap_or_default()
    }

    fn handle_choice(&mut self, choice: ChunkChoice, out: &mut Vec<AIEvent>) -> Option<String> {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            push(out, create_thinking(reasoning));
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            push(out, create_assistant_message(content, true, Vec::new()));
        }
        for fragment in delta.tool_calls {
            let call = self.pending.entry(fragment.index).or_default();
            if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                call.id = Some(id);
            }
            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    call.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                }
            }
        }
        choice.finish_reason.filter(|r| !r.is_empty())
    }

    fn flush_tool_calls(&mut self, out: &mut Vec<AIEvent>) {
        let mut started = Vec::new();
        for (_, call) in std::mem::take(&mut self.pending) {
            let name = if call.name.is_empty() {
                "unknown".to_string()
            } else {
                call.name.clone()
            };
            match begin_tool_call(&mut self.tracker, &name, call.id.as_deref(), call.args()) {
                Ok((info, start)) => {
                    out.push(start);
                    started.push(info);
                }
                Err(e) => log::debug!("[openai] dropped tool call {name}: {e}"),
            }
        }
        if !started.is_empty() {
            push(out, create_assistant_message("", false, started));
        }
    }

    fn finish(&mut self, reason: String, out: &mut Vec<AIEvent>) {
        if reason == "tool_calls" || !self.pending.is_empty() {
            self.flush_tool_calls(out);
        }
        self.finished = true;
        push(out, create_session_end(self.session_id(), reason));
    }
}

impl EventParser for OpenAiParser {
    fn engine_id(&self) -> EngineId {
        EngineId::OpenAi
    }

    fn parse(&mut self, raw: &Value) -> Vec<AIEvent> {
        let Some(chunk) = decode::<StreamChunk>(EngineId::OpenAi, raw) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if let Some(error) = chunk.error {
            let message = if error.message.trim().is_empty() {
                "OpenAI-compatible API returned an error".to_string()
            } else {
                error.message
            };
            self.finished = true;
            push(&mut out, create_error(message));
            return out;
        }

        if self.stream_id.is_none() {
            if let Some(id) = chunk.id.filter(|id| !id.is_empty()) {
                self.stream_id = Some(id.clone());
                push(&mut out, create_session_start(id));
            }
        }

        let mut finish_reason = None;
        for choice in chunk.choices {
            if let Some(reason) = self.handle_choice(choice, &mut out) {
                finish_reason = Some(reason);
            }
        }
        if let Some(usage) = chunk.usage {
            out.push(create_token_usage(usage.prompt_tokens, usage.completion_tokens));
        }
        if let Some(reason) = finish_reason {
            self.finish(reason, &mut out);
        }
        out
    }

    /// Handles SSE framing: `data:` payloads, comment and `event:` lines, and
    /// the `[DONE]` sentinel. Bare JSON lines (error bodies) are parsed as-is.
    fn parse_line(&mut self, line: &str) -> Vec<AIEvent> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
            return Vec::new();
        }
        let data = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
        if data == "[DONE]" {
            if self.finished {
                return Vec::new();
            }
            self.finished = true;
            let mut out = Vec::new();
            push(&mut out, create_session_end(self.session_id(), "done"));
            return out;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(raw) => self.parse(&raw),
            Err(e) => {
                log::debug!("[openai] skipping malformed frame: {e}");
                Vec::new()
            }
        }
    }

    fn tracker(&self) -> &ToolCallTracker {
        &self.tracker
    }

    fn reset(&mut self) {
        self.tracker.clear();
        self.stream_id = None;
        self.pending.clear();
        self.finished = false;
    }
}
