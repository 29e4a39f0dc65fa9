//! Translates IFlow stream records and session-transcript lines into canonical events.

use serde_json::Value;

use super::protocol::{IFlowRecord, ToolUseResult, TranscriptBlock, TranscriptEntry};
use crate::engines::parser::{
    begin_tool_call, decode, finish_tool_call, permission_progress, push, EventParser,
};
use crate::engines::tracker::ToolCallTracker;
use crate::engines::types::EngineId;
use crate::events::{
    create_assistant_message, create_error, create_progress, create_session_end,
    create_session_start, create_token_usage, AIEvent,
};

#[derive(Debug, Default)]
pub struct IFlowParser {
    tracker: ToolCallTracker,
    session_id: Option<String>,
}

impl IFlowParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_id(&self) -> String {
        self.session_id.clone().unwrap_or_default()
    }

    fn handle_assistant(&mut self, entry: TranscriptEntry, out: &mut Vec<AIEvent>) {
        let Some(message) = entry.message else {
            return;
        };
        let mut text = String::new();
        let mut started = Vec::new();

        for block in message.blocks() {
            match block {
                TranscriptBlock::Text { text: t } => text.push_str(&t),
                TranscriptBlock::ToolUse { id, name, input } => {
                    let name = name.unwrap_or_else(|| "unknown".to_string());
                    match begin_tool_call(&mut self.tracker, &name, id.as_deref(), input) {
                        Ok((info, start)) => {
                            out.push(start);
                            started.push(info);
                        }
                        Err(e) => log::debug!("[iflow] dropped tool_use {name}: {e}"),
                    }
                }
                TranscriptBlock::ToolResult { .. } | TranscriptBlock::Unknown => {}
            }
        }

        if !text.is_empty() || !started.is_empty() {
            push(out, create_assistant_message(text, false, started));
        }
        if let Some(usage) = &message.usage {
            out.push(create_token_usage(usage.input_tokens, usage.output_tokens));
        }
        if let Some(reason) = message.finished_reason() {
            push(out, create_session_end(self.session_id(), reason));
        }
    }

    fn handle_user(&mut self, entry: TranscriptEntry, out: &mut Vec<AIEvent>) {
        let Some(message) = entry.message else {
            return;
        };
        let summary = entry.tool_use_result.unwrap_or_default();

        for block in message.blocks() {
            let TranscriptBlock::ToolResult {
                tool_use_id,
                content,
                result_display,
                is_error,
            } = block
            else {
                continue;
            };
            let result = TranscriptBlock::tool_output(
                result_display.as_deref(),
                summary.result_display.as_deref(),
                &content,
            );
            let success = !is_error && !summary.failed();
            if let Some(event) = finish_tool_call(
                &mut self.tracker,
                tool_use_id.as_deref(),
                summary.tool_name.as_deref(),
                result,
                success,
            ) {
                out.push(event);
            }
        }
    }

    fn handle_tool_end(
        &mut self,
        tool_name: Option<String>,
        id: Option<String>,
        output: Value,
        success: Option<bool>,
        error: Option<String>,
        out: &mut Vec<AIEvent>,
    ) {
        let success = success.unwrap_or(error.is_none());
        let result = match (output, error) {
            (Value::Null, Some(error)) => Value::String(error),
            (output, _) => output,
        };
        if let Some(event) = finish_tool_call(
            &mut self.tracker,
            id.as_deref(),
            tool_name.as_deref(),
            result,
            success,
        ) {
            out.push(event);
        }
    }
}

impl EventParser for IFlowParser {
    fn engine_id(&self) -> EngineId {
        EngineId::IFlow
    }

    fn parse(&mut self, raw: &Value) -> Vec<AIEvent> {
        let Some(record) = decode::<IFlowRecord>(EngineId::IFlow, raw) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        match record {
            IFlowRecord::Token { text, content } => {
                if let Some(text) = IFlowRecord::token_text(text, content) {
                    push(&mut out, create_assistant_message(text, true, Vec::new()));
                }
            }
            IFlowRecord::ToolStart {
                tool_name,
                id,
                input,
            } => match begin_tool_call(&mut self.tracker, &tool_name, id.as_deref(), input) {
                Ok((_, start)) => out.push(start),
                Err(e) => log::debug!("[iflow] dropped tool_start {tool_name}: {e}"),
            },
            IFlowRecord::ToolEnd {
                tool_name,
                id,
                output,
                success,
                error,
            } => self.handle_tool_end(tool_name, id, output, success, error, &mut out),
            IFlowRecord::Progress { message, percent } => {
                push(&mut out, create_progress(message, percent));
            }
            IFlowRecord::PermissionRequest {
                tool_name,
                id,
                description,
                input,
            } => {
                if let Some(id) = id.filter(|id| !id.is_empty()) {
                    self.tracker.register_pending(&tool_name, id, input.clone());
                }
                let event = match description.filter(|d| !d.trim().is_empty()) {
                    Some(description) => create_progress(
                        format!("Waiting for permission: {tool_name} ({description})"),
                        None,
                    ),
                    None => permission_progress(&tool_name, &input),
                };
                push(&mut out, event);
            }
            IFlowRecord::SessionStart { session_id } => {
                self.session_id = Some(session_id.clone());
                push(&mut out, create_session_start(session_id));
            }
            IFlowRecord::SessionEnd { reason } => {
                let reason = reason
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "completed".to_string());
                push(&mut out, create_session_end(self.session_id(), reason));
            }
            IFlowRecord::Error { message } => push(&mut out, create_error(message)),
            IFlowRecord::Assistant(entry) => self.handle_assistant(entry, &mut out),
            IFlowRecord::User(entry) => self.handle_user(entry, &mut out),
            IFlowRecord::Unknown => {
                let kind = raw.get("type").and_then(Value::as_str).unwrap_or("<untyped>");
                log::debug!("[iflow] ignoring {kind} record");
            }
        }
        out
    }

    fn tracker(&self) -> &ToolCallTracker {
        &self.tracker
    }

    fn reset(&mut self) {
        self.tracker.clear();
        self.session_id = None;
    }
}
