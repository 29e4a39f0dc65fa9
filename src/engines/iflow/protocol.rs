//! Record types emitted by the IFlow CLI.
//!
//! Two vocabularies share one enum: the live event stream (`token`, `tool_start`,
//! `tool_end`, ...) and the session transcript written to
//! `~/.iflow/projects/<encoded path>/session-<id>.jsonl` (`assistant`, `user`).

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IFlowRecord {
    Token {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    ToolStart {
        tool_name: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        input: Value,
    },
    ToolEnd {
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        error: Option<String>,
    },
    Progress {
        message: String,
        #[serde(default)]
        percent: Option<f32>,
    },
    PermissionRequest {
        tool_name: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        input: Value,
    },
    SessionStart {
        session_id: String,
    },
    SessionEnd {
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        message: String,
    },
    Assistant(TranscriptEntry),
    User(TranscriptEntry),
    #[serde(other)]
    Unknown,
}

impl IFlowRecord {
    /// Text carried by a `token` record; IFlow has used both field names.
    pub fn token_text(text: Option<String>, content: Option<String>) -> Option<String> {
        text.or(content).filter(|t| !t.is_empty())
    }
}

/// One line of a session transcript.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<TranscriptMessage>,
    #[serde(default)]
    pub tool_use_result: Option<ToolUseResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptMessage {
    /// Either a plain string or an array of content blocks.
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<TranscriptUsage>,
}

impl TranscriptMessage {
    /// Content blocks; a plain string becomes a single text block.
    pub fn blocks(&self) -> Vec<TranscriptBlock> {
        match &self.content {
            Value::String(text) => vec![TranscriptBlock::Text { text: text.clone() }],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Stop reasons that mean the agent finished its turn.
    pub fn finished_reason(&self) -> Option<&str> {
        self.stop_reason
            .as_deref()
            .filter(|r| matches!(*r, "STOP" | "end_turn" | "max_tokens"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default, rename = "resultDisplay")]
        result_display: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

impl TranscriptBlock {
    /// Output of a `tool_result` block: `resultDisplay`, then the transcript-level
    /// display, then `content.functionResponse.response.output`, then the raw content.
    pub fn tool_output(
        result_display: Option<&str>,
        entry_display: Option<&str>,
        content: &Value,
    ) -> Value {
        if let Some(display) = result_display.or(entry_display) {
            return Value::String(display.to_string());
        }
        if let Some(response) = content.pointer("/functionResponse/response") {
            return match response.get("output") {
                Some(Value::String(output)) => Value::String(output.clone()),
                _ => response.clone(),
            };
        }
        content.clone()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseResult {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result_display: Option<String>,
}

impl ToolUseResult {
    pub fn failed(&self) -> bool {
        matches!(self.status.as_deref(), Some("error" | "failed" | "cancelled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_records() {
        let record = serde_json::from_str::<IFlowRecord>(
            r#"{"type":"tool_start","tool_name":"search","input":{"q":"x"}}"#,
        )
        .unwrap();
        let IFlowRecord::ToolStart { tool_name, id, input } = record else {
            panic!("expected tool_start");
        };
        assert_eq!(tool_name, "search");
        assert_eq!(id, None);
        assert_eq!(input, json!({"q": "x"}));

        let record =
            serde_json::from_str::<IFlowRecord>(r#"{"type":"session_end"}"#).unwrap();
        assert!(matches!(record, IFlowRecord::SessionEnd { reason: None }));
    }

    #[test]
    fn test_unknown_type() {
        let record = serde_json::from_str::<IFlowRecord>(r#"{"type":"frobnicate"}"#).unwrap();
        assert!(matches!(record, IFlowRecord::Unknown));
    }

    #[test]
    fn test_token_text_prefers_text_field() {
        assert_eq!(
            IFlowRecord::token_text(Some("a".into()), Some("b".into())).as_deref(),
            Some("a")
        );
        assert_eq!(
            IFlowRecord::token_text(None, Some("b".into())).as_deref(),
            Some("b")
        );
        assert_eq!(IFlowRecord::token_text(Some(String::new()), None), None);
    }

    #[test]
    fn test_transcript_string_content_is_text_block() {
        let record = serde_json::from_str::<IFlowRecord>(
            r#"{"type":"assistant","sessionId":"session-1","message":{"role":"assistant","content":"hi","stop_reason":"STOP"}}"#,
        )
        .unwrap();
        let IFlowRecord::Assistant(entry) = record else {
            panic!("expected assistant");
        };
        let message = entry.message.unwrap();
        assert!(matches!(&message.blocks()[..], [TranscriptBlock::Text { text }] if text == "hi"));
        assert_eq!(message.finished_reason(), Some("STOP"));
    }

    #[test]
    fn test_other_stop_reason_is_not_finished() {
        let message: TranscriptMessage =
            serde_json::from_value(json!({"content": [], "stop_reason": "tool_use"})).unwrap();
        assert_eq!(message.finished_reason(), None);
    }

    #[test]
    fn test_tool_output_precedence() {
        let content = json!({"functionResponse": {"response": {"output": "from response"}}});
        assert_eq!(
            TranscriptBlock::tool_output(Some("display"), Some("entry"), &content),
            json!("display")
        );
        assert_eq!(
            TranscriptBlock::tool_output(None, Some("entry"), &content),
            json!("entry")
        );
        assert_eq!(
            TranscriptBlock::tool_output(None, None, &content),
            json!("from response")
        );
        assert_eq!(
            TranscriptBlock::tool_output(None, None, &json!("raw")),
            json!("raw")
        );
    }
}
