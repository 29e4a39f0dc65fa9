//! Core types and traits for the engine abstraction layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::session::AISession;
use crate::bus::EventBus;
use crate::events::EventError;

/// Identifies an AI engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineId {
    #[default]
    ClaudeCode,
    #[serde(rename = "iflow")]
    IFlow,
    #[serde(rename = "openai")]
    OpenAi,
}

impl EngineId {
    pub const ALL: [EngineId; 3] = [EngineId::ClaudeCode, EngineId::IFlow, EngineId::OpenAi];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineId::ClaudeCode => "claude-code",
            EngineId::IFlow => "iflow",
            EngineId::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude-code" | "claude" => Ok(EngineId::ClaudeCode),
            "iflow" => Ok(EngineId::IFlow),
            // Older configs named the HTTP engine after its first provider.
            "openai" | "deepseek" => Ok(EngineId::OpenAi),
            _ => Err(EngineError::UnknownEngine(s.to_string())),
        }
    }
}

/// Errors surfaced by sessions, engines and the registry.
///
/// Lifecycle violations are programmer errors returned to the caller; transport
/// failures are also reported on the bus as `error` events.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session has been disposed")]
    SessionDisposed,
    #[error("task {task_id} is still running")]
    TaskActive { task_id: String },
    #[error("engine {0} does not support continuing a conversation")]
    ContinueUnsupported(EngineId),
    #[error("invalid task: {0}")]
    InvalidTask(#[from] EventError),
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("engine {engine} already runs its maximum of {limit} sessions")]
    SessionLimit { engine: EngineId, limit: usize },
    #[error("engine {0} is not available")]
    EngineUnavailable(EngineId),
    #[error("{message}")]
    Transport { message: String, recoverable: bool },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    pub fn transport(message: impl Into<String>) -> Self {
        EngineError::Transport {
            message: message.into(),
            recoverable: true,
        }
    }

    /// Whether this is a misuse of the session state machine rather than a
    /// backend failure.
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(
            self,
            EngineError::SessionDisposed
                | EngineError::TaskActive { .. }
                | EngineError::ContinueUnsupported(_)
                | EngineError::InvalidTask(_)
        )
    }
}

/// Capabilities of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineCapabilities {
    pub display_name: String,
    pub supports_streaming: bool,
    pub supports_abort: bool,
    pub supports_continue: bool,
    pub supports_thinking: bool,
    /// `None` means unlimited.
    pub max_concurrent_sessions: Option<usize>,
}

/// Per-session options supplied to [`super::EngineRegistry::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Engine to use; the registry default when `None`.
    pub engine: Option<EngineId>,
    pub work_dir: Option<PathBuf>,
    pub model: Option<String>,
    /// Engine-side conversation to resume on the first task.
    pub resume_session_id: Option<String>,
    pub task_timeout: Option<Duration>,
}

/// Fallbacks an engine applies to a [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub work_dir: Option<PathBuf>,
    pub task_timeout: Option<Duration>,
}

impl SessionDefaults {
    pub fn work_dir_for(&self, config: &SessionConfig) -> PathBuf {
        config
            .work_dir
            .clone()
            .or_else(|| self.work_dir.clone())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn timeout_for(&self, config: &SessionConfig) -> Option<Duration> {
        config.task_timeout.or(self.task_timeout)
    }
}

/// Prompt and context for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,
}

/// One request submitted to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AITask {
    pub id: String,
    pub input: TaskInput,
}

impl AITask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input: TaskInput {
                prompt: prompt.into(),
                files: Vec::new(),
            },
        }
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.input.files = files;
        self
    }

    /// Prompt with attached files appended as `@path` references.
    pub fn prompt_with_files(&self) -> String {
        if self.input.files.is_empty() {
            return self.input.prompt.clone();
        }
        let refs: Vec<String> = self
            .input
            .files
            .iter()
            .map(|p| format!("@{}", p.display()))
            .collect();
        format!("{}\n\n{}", self.input.prompt, refs.join(" "))
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Disposed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Disposed => "disposed",
        }
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Idle, SessionStatus::Running)
                | (SessionStatus::Running, SessionStatus::Idle)
                | (SessionStatus::Idle, SessionStatus::Disposed)
                | (SessionStatus::Running, SessionStatus::Disposed)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pluggable backend that knows how to build sessions (e.g., Claude Code, IFlow).
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns the id of this engine.
    fn id(&self) -> EngineId;

    /// Returns the capabilities of this engine.
    fn capabilities(&self) -> EngineCapabilities;

    /// Checks whether the engine can currently be used (CLI installed, API key set).
    async fn is_available(&self) -> bool;

    /// Creates a session bound to this engine, publishing on `bus`.
    fn create_session(
        &self,
        session_id: String,
        config: &SessionConfig,
        bus: EventBus,
    ) -> Result<Arc<dyn AISession>, EngineError>;
}
