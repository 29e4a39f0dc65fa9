//! Engine registry: maps engine ids to session factories and keeps a lookup
//! table of the sessions they created.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use super::claude::ClaudeEngine;
use super::iflow::IFlowEngine;
use super::openai::OpenAiEngine;
use super::session::AISession;
use super::types::{Engine, EngineCapabilities, EngineError, EngineId, SessionConfig, SessionStatus};
use crate::bus::{EventBus, Subscription};
use crate::config::RuntimeConfig;
use crate::events::AIEventType;

/// Default time an ended session stays visible before eviction.
pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(30);

struct TrackedSession {
    engine: EngineId,
    session: Weak<dyn AISession>,
    ended_at: Option<Instant>,
}

impl TrackedSession {
    fn live(&self) -> Option<Arc<dyn AISession>> {
        self.session
            .upgrade()
            .filter(|s| s.status() != SessionStatus::Disposed)
    }
}

type SessionTable = HashMap<String, TrackedSession>;

/// Drops dead, disposed, and long-ended idle sessions from `table`.
fn evict(table: &mut SessionTable, grace: Duration, now: Instant) -> usize {
    let before = table.len();
    table.retain(|_, tracked| {
        let Some(session) = tracked.live() else {
            return false;
        };
        match tracked.ended_at {
            Some(ended) if session.status() == SessionStatus::Idle => {
                now.saturating_duration_since(ended) < grace
            }
            _ => true,
        }
    });
    before - table.len()
}

pub struct EngineRegistry {
    engines: HashMap<EngineId, Arc<dyn Engine>>,
    default: EngineId,
    bus: EventBus,
    sessions: Arc<Mutex<SessionTable>>,
    grace: Duration,
    end_subscription: Subscription,
}

impl EngineRegistry {
    /// Creates an empty registry whose sessions publish on `bus`.
    pub fn new(bus: EventBus, grace: Duration) -> Self {
        let sessions: Arc<Mutex<SessionTable>> = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&sessions);
        let end_subscription = bus.on(AIEventType::SessionEnd, move |event| {
            if let Some(origin) = event.origin() {
                if let Some(tracked) = table.lock().get_mut(origin) {
                    tracked.ended_at = Some(Instant::now());
                }
            }
            Ok(())
        });
        Self {
            engines: HashMap::new(),
            default: EngineId::default(),
            bus,
            sessions,
            grace,
            end_subscription,
        }
    }

    /// Registry with the Claude Code, IFlow and OpenAI-compatible engines
    /// configured from `config`.
    pub fn with_defaults(config: &RuntimeConfig, bus: EventBus) -> Self {
        let defaults = config.session_defaults();
        let mut registry = Self::new(bus, config.eviction_grace());
        registry.register(Arc::new(ClaudeEngine::new(
            config.claude_code.clone(),
            defaults.clone(),
        )));
        registry.register(Arc::new(IFlowEngine::new(
            config.iflow.clone(),
            defaults.clone(),
        )));
        registry.register(Arc::new(OpenAiEngine::new(config.openai.clone(), defaults)));
        registry.set_default(config.default_engine);
        registry
    }

    /// Registers an engine, replacing any engine with the same id.
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.id(), engine);
    }

    pub fn get(&self, id: EngineId) -> Option<Arc<dyn Engine>> {
        self.engines.get(&id).cloned()
    }

    /// Registered engine ids in a stable order.
    pub fn engines(&self) -> Vec<EngineId> {
        EngineId::ALL
            .into_iter()
            .filter(|id| self.engines.contains_key(id))
            .collect()
    }

    pub fn capabilities(&self, id: EngineId) -> Option<EngineCapabilities> {
        self.engines.get(&id).map(|e| e.capabilities())
    }

    pub fn default_engine(&self) -> EngineId {
        self.default
    }

    pub fn set_default(&mut self, id: EngineId) {
        self.default = id;
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Creates a session on the requested (or default) engine.
    ///
    /// Fails with [`EngineError::SessionLimit`] when the engine already runs its
    /// maximum number of live sessions.
    pub fn create_session(&self, config: &SessionConfig) -> Result<Arc<dyn AISession>, EngineError> {
        let engine_id = config.engine.unwrap_or(self.default);
        let engine = self
            .get(engine_id)
            .ok_or_else(|| EngineError::UnknownEngine(engine_id.to_string()))?;
        let limit = engine.capabilities().max_concurrent_sessions;

        let mut table = self.sessions.lock();
        evict(&mut table, self.grace, Instant::now());
        if let Some(limit) = limit {
            let live = table
                .values()
                .filter(|t| t.engine == engine_id && t.live().is_some())
                .count();
            if live >= limit {
                log::warn!("[registry] {engine_id} is at its limit of {limit} sessions");
                return Err(EngineError::SessionLimit {
                    engine: engine_id,
                    limit,
                });
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = engine.create_session(session_id.clone(), config, self.bus.clone())?;
        table.insert(
            session_id.clone(),
            TrackedSession {
                engine: engine_id,
                session: Arc::downgrade(&session),
                ended_at: None,
            },
        );
        log::info!("[registry] created {engine_id} session {session_id}");
        Ok(session)
    }

    /// Whether the engine is registered and currently usable.
    pub async fn is_available(&self, id: EngineId) -> bool {
        match self.get(id) {
            Some(engine) => engine.is_available().await,
            None => false,
        }
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<dyn AISession>> {
        self.sessions.lock().get(id).and_then(|t| t.session.upgrade())
    }

    /// Live sessions, after evicting stale entries.
    pub fn get_sessions(&self) -> Vec<Arc<dyn AISession>> {
        let mut table = self.sessions.lock();
        evict(&mut table, self.grace, Instant::now());
        table.values().filter_map(TrackedSession::live).collect()
    }

    /// Removes stale entries and returns how many were dropped.
    pub fn evict_stale(&self) -> usize {
        let evicted = evict(&mut self.sessions.lock(), self.grace, Instant::now());
        if evicted > 0 {
            log::debug!("[registry] evicted {evicted} sessions");
        }
        evicted
    }

    /// Disposes every tracked session and empties the table.
    pub async fn cleanup(&self) {
        let sessions: Vec<Arc<dyn AISession>> = {
            let mut table = self.sessions.lock();
            table.drain().filter_map(|(_, t)| t.session.upgrade()).collect()
        };
        log::info!("[registry] disposing {} sessions", sessions.len());
        futures::future::join_all(sessions.iter().map(|s| s.dispose())).await;
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        self.end_subscription.unsubscribe();
    }
}
