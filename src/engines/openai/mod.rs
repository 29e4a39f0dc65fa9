//! OpenAI-compatible engine: streams Chat Completions over HTTP.

mod driver;
mod parser;
mod protocol;

pub use driver::{LineSplitter, OpenAiDriver};
pub use parser::OpenAiParser;
pub use protocol::ChatMessage;

use async_trait::async_trait;
use std::sync::Arc;

use super::session::{AISession, ManagedSession, SessionParts};
use super::types::{Engine, EngineCapabilities, EngineError, EngineId, SessionConfig, SessionDefaults};
use crate::bus::EventBus;
use crate::config::OpenAiSettings;

pub struct OpenAiEngine {
    settings: OpenAiSettings,
    defaults: SessionDefaults,
}

impl OpenAiEngine {
    pub fn new(settings: OpenAiSettings, defaults: SessionDefaults) -> Self {
        Self { settings, defaults }
    }
}

#[async_trait]
impl Engine for OpenAiEngine {
    fn id(&self) -> EngineId {
        EngineId::OpenAi
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            display_name: "OpenAI Compatible".to_string(),
            supports_streaming: true,
            supports_abort: true,
            supports_continue: true,
            supports_thinking: true,
            max_concurrent_sessions: None,
        }
    }

    async fn is_available(&self) -> bool {
        !self.settings.api_key.trim().is_empty()
    }

    fn create_session(
        &self,
        session_id: String,
        config: &SessionConfig,
        bus: EventBus,
    ) -> Result<Arc<dyn AISession>, EngineError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(EngineError::EngineUnavailable(EngineId::OpenAi));
        }
        let driver = OpenAiDriver::new(self.settings.clone(), config.model.clone());
        let session = ManagedSession::new(SessionParts {
            id: session_id,
            engine_id: EngineId::OpenAi,
            supports_continue: true,
            driver: Arc::new(driver),
            parser: Box::new(OpenAiParser::new()),
            bus,
            task_timeout: self.defaults.timeout_for(config),
            resume_session_id: config.resume_session_id.clone(),
        });
        Ok(Arc::new(session))
    }
}
