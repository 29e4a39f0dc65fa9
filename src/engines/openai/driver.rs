//! Streams chat completions from an OpenAI-compatible HTTP endpoint.
//!
//! The driver keeps the conversation history itself: each finished turn appends
//! the user prompt and the assembled assistant reply, and continuation resends the
//! whole history. A fresh task starts from an empty history.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Notify};

use super::protocol::{ChatMessage, ChatRequest, DEFAULT_SYSTEM_PROMPT};
use crate::config::OpenAiSettings;
use crate::engines::session::{EngineDriver, RawStream};
use crate::engines::types::{AITask, EngineError};
use crate::engines::utils::{abort_task_slot, new_task_slot, TaskSlot, RAW_CHANNEL_CAPACITY};
use crate::events::{AIEvent, AIEventKind};

#[derive(Debug, Default)]
struct Conversation {
    history: Vec<ChatMessage>,
    /// Prompt of the task in flight and the reply assembled so far.
    turn: Option<(String, String)>,
    last_response_id: Option<String>,
}

pub struct OpenAiDriver {
    settings: OpenAiSettings,
    model: String,
    client: reqwest::Client,
    conversation: SyncMutex<Conversation>,
    reader_task: TaskSlot,
    /// Bumped by every cancel; a request started under an older value is stale.
    generation: AtomicU64,
    cancelled: Notify,
}

impl OpenAiDriver {
    pub fn new(settings: OpenAiSettings, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| settings.model.clone());
        Self {
            settings,
            model,
            client: reqwest::Client::new(),
            conversation: SyncMutex::new(Conversation::default()),
            reader_task: new_task_slot(),
            generation: AtomicU64::new(0),
            cancelled: Notify::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    /// System prompt, prior turns, then the new prompt.
    pub fn build_request(&self, prompt: &str) -> ChatRequest {
        let system = self
            .settings
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(self.conversation.lock().history.iter().cloned());
        messages.push(ChatMessage::user(prompt));
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream: true,
        }
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.conversation.lock().history.clone()
    }
}

/// Splits a byte stream into lines, keeping partial lines (and partial UTF-8
/// sequences) buffered until their newline arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest).trim().to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

fn stream_error_record(message: String) -> String {
    serde_json::json!({"error": {"message": message}}).to_string()
}

#[async_trait]
impl EngineDriver for OpenAiDriver {
    async fn start(&self, task: &AITask, resume: Option<String>) -> Result<RawStream, EngineError> {
        abort_task_slot(&self.reader_task).await;

        let prompt = task.prompt_with_files();
        {
            let mut conversation = self.conversation.lock();
            if resume.is_none() {
                conversation.history.clear();
                conversation.last_response_id = None;
            }
            conversation.turn = Some((prompt.clone(), String::new()));
        }

        let request = self.build_request(&prompt);
        let url = self.endpoint();
        log::info!(
            "[openai] POST {url} (model {}, {} messages)",
            request.model,
            request.messages.len()
        );

        let generation = self.generation.load(Ordering::Acquire);
        let cancelled = self.cancelled.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send();
        let response = tokio::select! {
            biased;
            _ = &mut cancelled => None,
            response = send => Some(response?),
        };
        let response = match response {
            Some(response) if self.generation.load(Ordering::Acquire) == generation => response,
            _ => {
                log::info!("[openai] request to {url} cancelled before the response");
                return Err(EngineError::transport("Request cancelled"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("[openai] API error ({status}): {body}");
            return Err(EngineError::Transport {
                message: format!("OpenAI API error ({status}): {body}"),
                recoverable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut splitter = LineSplitter::default();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for line in splitter.push(&bytes) {
                            if tx.send(line).await.is_err() {
                                log::debug!("[openai] receiver dropped, stopping stream");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[openai] stream error: {e}");
                        let _ = tx
                            .send(stream_error_record(format!("Stream interrupted: {e}")))
                            .await;
                        return;
                    }
                }
            }
            if let Some(rest) = splitter.finish() {
                let _ = tx.send(rest).await;
            }
        });
        *self.reader_task.lock().await = Some(reader);

        Ok(rx)
    }

    fn observe(&self, event: &AIEvent) {
        let mut conversation = self.conversation.lock();
        match event.kind() {
            AIEventKind::SessionStart { session_id } => {
                conversation.last_response_id = Some(session_id.clone());
            }
            AIEventKind::AssistantMessage {
                text,
                is_delta: true,
                ..
            } => {
                if let Some((_, reply)) = conversation.turn.as_mut() {
                    reply.push_str(text);
                }
            }
            AIEventKind::SessionEnd { .. } => {
                if let Some((prompt, reply)) = conversation.turn.take() {
                    conversation.history.push(ChatMessage::user(prompt));
                    conversation.history.push(ChatMessage::assistant(reply));
                }
            }
            AIEventKind::Error { .. } => {
                conversation.turn = None;
            }
            _ => {}
        }
    }

    fn resume_handle(&self) -> Option<String> {
        let conversation = self.conversation.lock();
        if conversation.history.is_empty() {
            return None;
        }
        Some(
            conversation
                .last_response_id
                .clone()
                .unwrap_or_else(|| "history".to_string()),
        )
    }

    async fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cancelled.notify_waiters();
        abort_task_slot(&self.reader_task).await;
        self.conversation.lock().turn = None;
    }

    async fn cleanup(&self) {
        self.cancel().await;
        let mut conversation = self.conversation.lock();
        conversation.history.clear();
        conversation.last_response_id = None;
    }
}
