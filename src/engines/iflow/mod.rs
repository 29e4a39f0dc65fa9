//! IFlow engine: drives the `iflow` CLI and follows its session transcript.

mod driver;
mod parser;
mod protocol;

pub use driver::{encode_project_path, extract_session_id, find_transcript, IFlowDriver};
pub use parser::IFlowParser;

use async_trait::async_trait;
use std::sync::Arc;

use super::session::{AISession, ManagedSession, SessionParts};
use super::types::{Engine, EngineCapabilities, EngineError, EngineId, SessionConfig, SessionDefaults};
use super::utils::cli_version;
use crate::bus::EventBus;
use crate::config::IFlowSettings;

pub struct IFlowEngine {
    settings: IFlowSettings,
    defaults: SessionDefaults,
}

impl IFlowEngine {
    pub fn new(settings: IFlowSettings, defaults: SessionDefaults) -> Self {
        Self { settings, defaults }
    }
}

#[async_trait]
impl Engine for IFlowEngine {
    fn id(&self) -> EngineId {
        EngineId::IFlow
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            display_name: "IFlow".to_string(),
            supports_streaming: true,
            supports_abort: true,
            supports_continue: true,
            supports_thinking: false,
            max_concurrent_sessions: None,
        }
    }

    async fn is_available(&self) -> bool {
        cli_version(&self.settings.cli_path).await.is_some()
    }

    fn create_session(
        &self,
        session_id: String,
        config: &SessionConfig,
        bus: EventBus,
    ) -> Result<Arc<dyn AISession>, EngineError> {
        let driver = IFlowDriver::new(self.settings.clone(), self.defaults.work_dir_for(config));
        let session = ManagedSession::new(SessionParts {
            id: session_id,
            engine_id: EngineId::IFlow,
            supports_continue: true,
            driver: Arc::new(driver),
            parser: Box::new(IFlowParser::new()),
            bus,
            task_timeout: self.defaults.timeout_for(config),
            resume_session_id: config.resume_session_id.clone(),
        });
        Ok(Arc::new(session))
    }
}
