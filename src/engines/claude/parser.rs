//! Translates Claude CLI stream-json records into canonical events.

use serde_json::Value;

use super::cli_protocol::{
    AssistantEvent, BlockDelta, CliEvent, ContentBlock, MessageContent, ResultEvent,
    StreamPayload, UsageInfo,
};
use crate::engines::parser::{
    begin_tool_call, decode, finish_tool_call, flatten_text, permission_progress, push,
    EventParser,
};
use crate::engines::tracker::ToolCallTracker;
use crate::engines::types::EngineId;
use crate::events::{
    create_assistant_message, create_error, create_session_end, create_session_start,
    create_thinking, create_token_usage, AIEvent,
};

#[derive(Debug, Default)]
pub struct ClaudeParser {
    tracker: ToolCallTracker,
    cli_session_id: Option<String>,
}

impl ClaudeParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_assistant(&mut self, event: AssistantEvent, out: &mut Vec<AIEvent>) {
        let mut text = String::new();
        let mut started = Vec::new();

        for block in event.message.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::Thinking { thinking } => push(out, create_thinking(thinking)),
                ContentBlock::ToolUse { id, name, input } => {
                    match begin_tool_call(&mut self.tracker, &name, Some(&id), input) {
                        Ok((info, start)) => {
                            out.push(start);
                            started.push(info);
                        }
                        Err(e) => log::debug!("[claude] dropped tool_use {id}: {e}"),
                    }
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => self.handle_tool_result(&tool_use_id, &content, is_error, out),
                ContentBlock::Unknown => {}
            }
        }

        if !text.is_empty() || !started.is_empty() {
            push(out, create_assistant_message(text, false, started));
        }
        if let Some(usage) = event.message.usage {
            push_usage(&usage, out);
        }
    }

    fn handle_tool_result(
        &mut self,
        tool_use_id: &str,
        content: &Value,
        is_error: bool,
        out: &mut Vec<AIEvent>,
    ) {
        let result = Value::String(flatten_text(content));
        if let Some(event) =
            finish_tool_call(&mut self.tracker, Some(tool_use_id), None, result, !is_error)
        {
            out.push(event);
        }
    }

    fn handle_result(&mut self, result: ResultEvent, out: &mut Vec<AIEvent>) {
        if let Some(usage) = &result.usage {
            push_usage(usage, out);
        }
        let session_id = result
            .session_id
            .clone()
            .or_else(|| self.cli_session_id.clone())
            .unwrap_or_default();

        if result.is_aborted {
            push(out, create_session_end(session_id, "aborted"));
        } else if result.is_failure() {
            let message = result
                .result
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| format!("Claude CLI reported {}", result.subtype));
            push(out, create_error(message));
        } else {
            push(out, create_session_end(session_id, "completed"));
        }
    }
}

fn push_usage(usage: &UsageInfo, out: &mut Vec<AIEvent>) {
    out.push(create_token_usage(usage.total_input(), usage.output_tokens));
}

impl EventParser for ClaudeParser {
    fn engine_id(&self) -> EngineId {
        EngineId::ClaudeCode
    }

    fn parse(&mut self, raw: &Value) -> Vec<AIEvent> {
        let Some(event) = decode::<CliEvent>(EngineId::ClaudeCode, raw) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        match event {
            CliEvent::System(system) => {
                if system.subtype == "init" {
                    if let Some(id) = system.session_id {
                        self.cli_session_id = Some(id.clone());
                        push(&mut out, create_session_start(id));
                    }
                } else {
                    log::debug!("[claude] system/{} ignored", system.subtype);
                }
            }
            CliEvent::Assistant(assistant) => self.handle_assistant(assistant, &mut out),
            CliEvent::User(user) => {
                // Plain user text is the echo of our own prompt.
                if let MessageContent::Blocks(blocks) = user.message.content {
                    for block in blocks {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } = block
                        {
                            self.handle_tool_result(&tool_use_id, &content, is_error, &mut out);
                        }
                    }
                }
            }
            CliEvent::StreamEvent(record) => match record.event {
                StreamPayload::ContentBlockDelta {
                    delta: BlockDelta::TextDelta { text },
                    ..
                } if !text.is_empty() => {
                    push(&mut out, create_assistant_message(text, true, Vec::new()));
                }
                StreamPayload::ContentBlockDelta {
                    delta: BlockDelta::ThinkingDelta { thinking },
                    ..
                } => push(&mut out, create_thinking(thinking)),
                _ => {}
            },
            CliEvent::Result(result) => self.handle_result(result, &mut out),
            CliEvent::ControlRequest(request) => match request.request.permission_target() {
                Some((tool_name, input)) => {
                    push(&mut out, permission_progress(&tool_name, &input));
                }
                None => log::debug!(
                    "[claude] control_request {} ({}) ignored",
                    request.request_id,
                    request.request.subtype
                ),
            },
            CliEvent::ControlResponse(_) => {}
            CliEvent::Unknown => {
                let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();
                log::debug!("[claude] unknown record type {kind:?}");
            }
        }
        out
    }

    fn tracker(&self) -> &ToolCallTracker {
        &self.tracker
    }

    fn reset(&mut self) {
        self.tracker.clear();
        self.cli_session_id = None;
    }
}
