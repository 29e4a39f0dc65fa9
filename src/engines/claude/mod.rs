//! Claude Code engine: drives the `claude` CLI in stream-json mode.

mod cli_protocol;
mod driver;
mod parser;

pub use driver::ClaudeCliDriver;
pub use parser::ClaudeParser;

use async_trait::async_trait;
use std::sync::Arc;

use super::session::{AISession, ManagedSession, SessionParts};
use super::types::{Engine, EngineCapabilities, EngineError, EngineId, SessionConfig, SessionDefaults};
use super::utils::cli_version;
use crate::bus::EventBus;
use crate::config::ClaudeCodeSettings;

pub struct ClaudeEngine {
    settings: ClaudeCodeSettings,
    defaults: SessionDefaults,
}

impl ClaudeEngine {
    pub fn new(settings: ClaudeCodeSettings, defaults: SessionDefaults) -> Self {
        Self { settings, defaults }
    }
}

#[async_trait]
impl Engine for ClaudeEngine {
    fn id(&self) -> EngineId {
        EngineId::ClaudeCode
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            display_name: "Claude Code".to_string(),
            supports_streaming: true,
            supports_abort: true,
            supports_continue: true,
            supports_thinking: true,
            max_concurrent_sessions: None,
        }
    }

    async fn is_available(&self) -> bool {
        match cli_version(&self.settings.cli_path).await {
            Some(version) => {
                log::debug!("[claude] found {} ({version})", self.settings.cli_path);
                true
            }
            None => false,
        }
    }

    fn create_session(
        &self,
        session_id: String,
        config: &SessionConfig,
        bus: EventBus,
    ) -> Result<Arc<dyn AISession>, EngineError> {
        let driver = ClaudeCliDriver::new(
            self.settings.clone(),
            self.defaults.work_dir_for(config),
            config.model.clone(),
        );
        let session = ManagedSession::new(SessionParts {
            id: session_id,
            engine_id: EngineId::ClaudeCode,
            supports_continue: true,
            driver: Arc::new(driver),
            parser: Box::new(ClaudeParser::new()),
            bus,
            task_timeout: self.defaults.timeout_for(config),
            resume_session_id: config.resume_session_id.clone(),
        });
        Ok(Arc::new(session))
    }
}
