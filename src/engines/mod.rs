//! Engine abstraction layer.
//!
//! Every backend (Claude Code CLI, IFlow CLI, OpenAI-compatible HTTP) plugs in as
//! an [`Engine`] that builds [`ManagedSession`]s from a backend-specific driver and
//! parser. The session state machine, the drain loop and the tool-call tracker are
//! shared.

pub mod claude;
pub mod iflow;
pub mod openai;
pub mod parser;
mod registry;
pub mod session;
mod tool_target;
mod tracker;
mod types;
pub(crate) mod utils;

pub use parser::EventParser;
pub use registry::{EngineRegistry, DEFAULT_EVICTION_GRACE};
pub use session::{
    drain_events, AISession, DrainOutcome, EngineDriver, EventSink, ManagedSession, RawStream,
    SessionParts, TaskControl, CANCEL_TIMEOUT,
};
pub use tool_target::describe_tool_target;
pub use tracker::ToolCallTracker;
pub use types::{
    AITask, Engine, EngineCapabilities, EngineError, EngineId, SessionConfig, SessionDefaults,
    SessionStatus, TaskInput,
};
