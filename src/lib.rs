//! Polaris: a runtime that drives AI coding backends (the Claude Code CLI, the
//! IFlow CLI and OpenAI-compatible HTTP APIs) and normalizes their output into one
//! stream of [`events::AIEvent`]s published on an [`EventBus`].

pub mod bus;
pub mod config;
pub mod engines;
pub mod events;
pub mod inspector;
pub mod todo_sync;

pub use bus::{EventBus, HandlerError, HandlerResult, Subscription, SubscriptionGuard};
pub use config::{ConfigError, RuntimeConfig};
pub use engines::{
    AISession, AITask, Engine, EngineCapabilities, EngineError, EngineId, EngineRegistry,
    SessionConfig, SessionStatus,
};
pub use events::{AIEvent, AIEventKind, AIEventType};
pub use inspector::DeveloperInspector;
pub use todo_sync::{InMemoryTodoStore, TodoStore, TodoSync};
