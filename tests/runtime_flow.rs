//! End-to-end session behaviour against a scripted backend.
//!
//! `ScriptedDriver` replays canned IFlow records instead of spawning a CLI, so
//! these tests exercise the real session state machine, drain loop, parser,
//! registry and bus consumers without any external process.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use polaris_lib::engines::iflow::IFlowParser;
use polaris_lib::engines::{EngineDriver, ManagedSession, RawStream, SessionParts};
use polaris_lib::events::{AIEvent, AIEventKind, AIEventType};
use polaris_lib::todo_sync::InMemoryTodoStore;
use polaris_lib::{
    AISession, AITask, EngineError, EngineId, EngineRegistry, EventBus, RuntimeConfig,
    SessionConfig, SessionStatus, TodoStore, TodoSync,
};

// ============================================================================
// Harness
// ============================================================================

#[derive(Default)]
struct ScriptedDriver {
    script: Vec<String>,
    /// Keep the stream open after the script, like a backend that never finishes.
    hold_open: bool,
    fail_start: bool,
    /// Start waits until cancelled, like a request stuck before its response.
    stall_start: bool,
    stalled: Notify,
    resume: Option<String>,
    /// Time cleanup takes before it closes open streams.
    cleanup_delay: Option<Duration>,
    open: Mutex<Vec<mpsc::Sender<String>>>,
    starts: Mutex<Vec<Option<String>>>,
    cancels: AtomicUsize,
    cleanups: AtomicUsize,
}

impl ScriptedDriver {
    fn new(records: &[serde_json::Value]) -> Self {
        Self {
            script: records.iter().map(|r| r.to_string()).collect(),
            ..Self::default()
        }
    }

    fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait]
impl EngineDriver for ScriptedDriver {
    async fn start(&self, _task: &AITask, resume: Option<String>) -> Result<RawStream, EngineError> {
        self.starts.lock().push(resume);
        if self.fail_start {
            return Err(EngineError::transport("backend refused to start"));
        }
        if self.stall_start {
            self.stalled.notified().await;
            return Err(EngineError::transport("Request cancelled"));
        }
        let (tx, rx) = mpsc::channel(self.script.len() + 1);
        for line in &self.script {
            tx.try_send(line.clone()).expect("channel sized for script");
        }
        if self.hold_open {
            self.open.lock().push(tx);
        }
        Ok(rx)
    }

    fn resume_handle(&self) -> Option<String> {
        self.resume.clone()
    }

    async fn cancel(&self) {
        self.stalled.notify_one();
        self.open.lock().clear();
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    async fn cleanup(&self) {
        if let Some(delay) = self.cleanup_delay {
            tokio::time::sleep(delay).await;
        }
        self.open.lock().clear();
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    bus: EventBus,
    events: Arc<Mutex<Vec<AIEvent>>>,
    driver: Arc<ScriptedDriver>,
    session: ManagedSession,
}

impl Harness {
    fn new(driver: ScriptedDriver) -> Self {
        Self::with_options(driver, true, None)
    }

    fn with_options(driver: ScriptedDriver, supports_continue: bool, timeout: Option<Duration>) -> Self {
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.on_any(move |event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        let driver = Arc::new(driver);
        let session = ManagedSession::new(SessionParts {
            id: "rt-1".into(),
            engine_id: EngineId::IFlow,
            supports_continue,
            driver: driver.clone(),
            parser: Box::new(IFlowParser::new()),
            bus: bus.clone(),
            task_timeout: timeout,
            resume_session_id: None,
        });
        Self {
            bus,
            events,
            driver,
            session,
        }
    }

    fn count(&self, event_type: AIEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    fn types(&self) -> Vec<AIEventType> {
        self.events.lock().iter().map(AIEvent::event_type).collect()
    }

    async fn wait_for(&self, event_type: AIEventType, n: usize) {
        wait_until(|| self.count(event_type) >= n).await;
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Lets spawned tasks run to quiescence before asserting that nothing else arrived.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn progress(message: &str) -> serde_json::Value {
    json!({"type": "progress", "message": message})
}

// ============================================================================
// Task lifecycle
// ============================================================================

#[tokio::test]
async fn test_progress_then_end_returns_to_idle_with_one_session_end() {
    let h = Harness::new(ScriptedDriver::new(&[
        progress("reading"),
        progress("thinking"),
        progress("writing"),
        json!({"type": "session_end", "reason": "completed"}),
    ]));

    h.session.run(AITask::new("do it")).await.unwrap();
    h.wait_for(AIEventType::SessionEnd, 1).await;
    settle().await;

    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.session.current_task_id(), None);
    assert_eq!(
        h.types(),
        vec![
            AIEventType::UserMessage,
            AIEventType::Progress,
            AIEventType::Progress,
            AIEventType::Progress,
            AIEventType::SessionEnd,
        ]
    );

    let events = h.events.lock();
    assert!(events.iter().all(|e| e.origin() == Some("rt-1")));
    assert!(events.windows(2).all(|w| w[0].timestamp() < w[1].timestamp()));
    match events.last().unwrap().kind() {
        AIEventKind::SessionEnd { session_id, reason } => {
            assert_eq!(session_id, "rt-1");
            assert_eq!(reason, "completed");
        }
        other => panic!("expected session_end, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_closing_without_end_synthesizes_completion() {
    let h = Harness::new(ScriptedDriver::new(&[progress("only")]));

    h.session.run(AITask::new("go")).await.unwrap();
    h.wait_for(AIEventType::SessionEnd, 1).await;
    settle().await;

    assert_eq!(h.count(AIEventType::SessionEnd), 1);
    assert_eq!(h.session.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn test_tool_calls_without_ids_pair_by_name() {
    let h = Harness::new(ScriptedDriver::new(&[
        json!({"type": "tool_start", "tool_name": "search", "input": {"q": "x"}}),
        json!({"type": "tool_end", "tool_name": "search", "output": "y"}),
        json!({"type": "session_end"}),
    ]));

    h.session.run(AITask::new("find")).await.unwrap();
    h.wait_for(AIEventType::SessionEnd, 1).await;

    let events = h.events.lock();
    let start_id = events.iter().find_map(|e| match e.kind() {
        AIEventKind::ToolCallStart { call_id, .. } => Some(call_id.clone()),
        _ => None,
    });
    let end = events.iter().find_map(|e| match e.kind() {
        AIEventKind::ToolCallEnd {
            call_id,
            result,
            success,
            ..
        } => Some((call_id.clone(), result.clone(), *success)),
        _ => None,
    });
    let (end_id, result, success) = end.expect("tool_call_end published");
    assert_eq!(Some(end_id), start_id);
    assert_eq!(result, json!("y"));
    assert!(success);
    drop(events);

    let calls = h.session.tool_calls_snapshot();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].status.is_terminal());
}

#[tokio::test]
async fn test_driver_start_failure_reports_error_and_stays_usable() {
    let driver = ScriptedDriver {
        fail_start: true,
        ..ScriptedDriver::default()
    };
    let h = Harness::new(driver);

    let err = h.session.run(AITask::new("go")).await.unwrap_err();
    assert!(matches!(err, EngineError::Transport { .. }));
    assert!(!err.is_lifecycle_violation());
    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.types(), vec![AIEventType::UserMessage, AIEventType::Error]);
}

#[tokio::test]
async fn test_empty_prompt_is_rejected() {
    let h = Harness::new(ScriptedDriver::new(&[]));
    let err = h.session.run(AITask::new("  ")).await.unwrap_err();
    assert!(err.is_lifecycle_violation());
    assert!(h.driver.starts.lock().is_empty());
    assert_eq!(h.session.status(), SessionStatus::Idle);
}

// ============================================================================
// Abort and dispose
// ============================================================================

#[tokio::test]
async fn test_mismatched_abort_is_a_noop() {
    let h = Harness::new(
        ScriptedDriver::new(&[json!({"type": "tool_start", "tool_name": "read", "id": "c1"})])
            .holding_open(),
    );
    let task = AITask::new("go");
    let task_id = task.id.clone();
    h.session.run(task).await.unwrap();
    h.wait_for(AIEventType::ToolCallStart, 1).await;

    let calls_before = h.session.tool_calls_snapshot();
    assert!(!h.session.abort(Some("some-other-task")).await);
    assert_eq!(h.session.status(), SessionStatus::Running);
    assert_eq!(h.session.current_task_id().as_deref(), Some(task_id.as_str()));
    assert_eq!(h.session.tool_calls_snapshot(), calls_before);
    assert_eq!(h.driver.cancels.load(Ordering::SeqCst), 0);

    let err = h.session.run(AITask::new("second")).await.unwrap_err();
    assert!(matches!(err, EngineError::TaskActive { task_id: ref id } if *id == task_id));

    h.session.dispose().await;
}

#[tokio::test]
async fn test_abort_ends_task_with_aborted_reason() {
    let h = Harness::new(ScriptedDriver::new(&[progress("working")]).holding_open());
    let task = AITask::new("go");
    let task_id = task.id.clone();
    h.session.run(task).await.unwrap();
    h.wait_for(AIEventType::Progress, 1).await;

    assert!(h.session.abort(Some(&task_id)).await);
    h.wait_for(AIEventType::SessionEnd, 1).await;
    settle().await;

    assert!(!h.session.abort(None).await);
    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.driver.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.count(AIEventType::SessionEnd), 1);
    let reason = h.events.lock().iter().find_map(|e| match e.kind() {
        AIEventKind::SessionEnd { reason, .. } => Some(reason.clone()),
        _ => None,
    });
    assert_eq!(reason.as_deref(), Some("aborted"));
}

#[tokio::test]
async fn test_abort_from_inside_a_handler() {
    let h = Harness::new(ScriptedDriver::new(&[progress("first"), progress("second")]).holding_open());
    let session = Arc::new(h.session);
    let weak = Arc::downgrade(&session);
    let _sub = session.on_event(Box::new(move |event: &AIEvent| {
        if event.event_type() == AIEventType::Progress {
            if let Some(session) = weak.upgrade() {
                session.request_abort(None);
            }
        }
        Ok(())
    }));

    session.run(AITask::new("go")).await.unwrap();
    wait_until(|| {
        h.events
            .lock()
            .iter()
            .any(|e| e.event_type() == AIEventType::SessionEnd)
    })
    .await;
    settle().await;

    let types: Vec<AIEventType> = h.events.lock().iter().map(AIEvent::event_type).collect();
    assert_eq!(
        types,
        vec![
            AIEventType::UserMessage,
            AIEventType::Progress,
            AIEventType::SessionEnd
        ]
    );
    assert_eq!(session.status(), SessionStatus::Idle);
    session.dispose().await;
}

#[tokio::test]
async fn test_abort_while_backend_is_starting() {
    let h = Harness::new(ScriptedDriver {
        stall_start: true,
        ..ScriptedDriver::default()
    });
    let session = Arc::new(h.session);
    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run(AITask::new("go")).await })
    };
    wait_until(|| h.driver.starts.lock().len() == 1).await;
    assert_eq!(session.status(), SessionStatus::Running);

    assert!(session.abort(None).await);
    pending.await.unwrap().unwrap();
    settle().await;

    assert_eq!(session.status(), SessionStatus::Idle);
    let types: Vec<AIEventType> = h.events.lock().iter().map(AIEvent::event_type).collect();
    assert_eq!(types, vec![AIEventType::UserMessage, AIEventType::SessionEnd]);
    let reason = h.events.lock().iter().find_map(|e| match e.kind() {
        AIEventKind::SessionEnd { reason, .. } => Some(reason.clone()),
        _ => None,
    });
    assert_eq!(reason.as_deref(), Some("aborted"));
}

#[tokio::test]
async fn test_double_dispose_emits_one_session_end() {
    let h = Harness::new(ScriptedDriver::new(&[progress("working")]).holding_open());
    h.session.run(AITask::new("go")).await.unwrap();
    h.wait_for(AIEventType::Progress, 1).await;

    h.session.dispose().await;
    h.session.dispose().await;
    settle().await;

    assert_eq!(h.session.status(), SessionStatus::Disposed);
    assert_eq!(h.count(AIEventType::SessionEnd), 1);
    assert_eq!(h.count(AIEventType::Error), 0);
    assert_eq!(h.driver.cleanups.load(Ordering::SeqCst), 1);

    let err = h.session.run(AITask::new("again")).await.unwrap_err();
    assert!(matches!(err, EngineError::SessionDisposed));
    assert!(!h.session.abort(None).await);
}

#[tokio::test]
async fn test_disposed_session_rejects_any_prompt_as_disposed() {
    let h = Harness::new(ScriptedDriver::new(&[]));
    h.session.dispose().await;

    let err = h.session.run(AITask::new("  ")).await.unwrap_err();
    assert!(matches!(err, EngineError::SessionDisposed));
    let err = h.session.continue_with(String::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::SessionDisposed));
    assert!(h.driver.starts.lock().is_empty());
}

#[tokio::test]
async fn test_dispose_idle_session_is_silent() {
    let h = Harness::new(ScriptedDriver::new(&[]));
    h.session.dispose().await;
    settle().await;
    assert!(h.events.lock().is_empty());
    assert_eq!(h.bus.handler_count(), 1);
}

// ============================================================================
// Timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_error_and_cleans_up() {
    let h = Harness::with_options(
        ScriptedDriver::new(&[progress("slow")]).holding_open(),
        true,
        Some(Duration::from_secs(2)),
    );
    h.session.run(AITask::new("go")).await.unwrap();
    h.wait_for(AIEventType::Error, 1).await;
    wait_until(|| h.driver.cleanups.load(Ordering::SeqCst) == 1).await;

    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.count(AIEventType::SessionEnd), 0);
    let message = h.events.lock().iter().find_map(|e| match e.kind() {
        AIEventKind::Error { message } => Some(message.clone()),
        _ => None,
    });
    assert_eq!(message.as_deref(), Some("Task timed out after 2s"));
}

#[tokio::test]
async fn test_task_started_from_timeout_error_survives_slow_cleanup() {
    let h = Harness::with_options(
        ScriptedDriver {
            cleanup_delay: Some(Duration::from_millis(20)),
            ..ScriptedDriver::new(&[progress("slow")]).holding_open()
        },
        true,
        Some(Duration::from_millis(300)),
    );
    let session = Arc::new(h.session);
    let weak = Arc::downgrade(&session);
    let _sub = session.on_event(Box::new(move |event: &AIEvent| {
        if event.event_type() == AIEventType::Error {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move { session.run(AITask::new("second")).await });
            }
        }
        Ok(())
    }));

    session.run(AITask::new("first")).await.unwrap();
    wait_until(|| h.driver.starts.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(session.status(), SessionStatus::Running);
    assert_eq!(h.driver.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(h.driver.open.lock().len(), 1);
    let ends: Vec<AIEventType> = h
        .events
        .lock()
        .iter()
        .map(AIEvent::event_type)
        .filter(|t| *t == AIEventType::SessionEnd)
        .collect();
    assert!(ends.is_empty(), "second task ended early: {:?}", ends);
    session.dispose().await;
}

// ============================================================================
// Continuation
// ============================================================================

#[tokio::test]
async fn test_continue_unsupported() {
    let h = Harness::with_options(ScriptedDriver::new(&[]), false, None);
    let err = h.session.continue_with("more".into()).await.unwrap_err();
    assert!(matches!(err, EngineError::ContinueUnsupported(EngineId::IFlow)));
    assert!(h.driver.starts.lock().is_empty());
}

#[tokio::test]
async fn test_continue_passes_resume_handle() {
    let driver = ScriptedDriver {
        resume: Some("session-abc".into()),
        ..ScriptedDriver::new(&[json!({"type": "session_end", "reason": "completed"})])
    };
    let h = Harness::new(driver);

    h.session.run(AITask::new("first")).await.unwrap();
    h.wait_for(AIEventType::SessionEnd, 1).await;
    let task_id = h.session.continue_with("second".into()).await.unwrap();
    assert!(!task_id.is_empty());
    h.wait_for(AIEventType::SessionEnd, 2).await;

    assert_eq!(
        *h.driver.starts.lock(),
        vec![None, Some("session-abc".to_string())]
    );
}

// ============================================================================
// Registry and consumers
// ============================================================================

#[tokio::test]
async fn test_registry_with_default_engines() {
    let bus = EventBus::new();
    let mut config = RuntimeConfig::default();
    config.openai.api_key.clear();
    let mut registry = EngineRegistry::with_defaults(&config, bus);

    assert_eq!(
        registry.engines(),
        vec![EngineId::ClaudeCode, EngineId::IFlow, EngineId::OpenAi]
    );
    assert!(!registry.capabilities(EngineId::IFlow).unwrap().supports_thinking);
    assert!(registry.capabilities(EngineId::ClaudeCode).unwrap().supports_abort);

    registry.set_default(EngineId::OpenAi);
    let err = registry.create_session(&SessionConfig::default()).err().unwrap();
    assert!(matches!(err, EngineError::EngineUnavailable(EngineId::OpenAi)));

    let session = registry
        .create_session(&SessionConfig {
            engine: Some(EngineId::ClaudeCode),
            ..SessionConfig::default()
        })
        .unwrap();
    assert_eq!(session.engine_id(), EngineId::ClaudeCode);
    assert!(registry.get_session(session.id()).is_some());

    registry.cleanup().await;
    assert_eq!(session.status(), SessionStatus::Disposed);
    assert!(registry.get_sessions().is_empty());
}

#[tokio::test]
async fn test_todo_write_from_session_lands_in_store() {
    let h = Harness::new(ScriptedDriver::new(&[
        json!({
            "type": "tool_start",
            "tool_name": "todo_write",
            "id": "t-call",
            "input": {"todos": [{"content": "Write tests", "status": "in_progress"}]}
        }),
        json!({"type": "session_end"}),
    ]));
    let store = Arc::new(InMemoryTodoStore::with_bus(h.bus.clone()));
    let _sync = TodoSync::attach(&h.bus, store.clone());

    h.session.run(AITask::new("plan")).await.unwrap();
    h.wait_for(AIEventType::SessionEnd, 1).await;

    let todos = store.list();
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].id, "rt-1-todo-0");
    assert_eq!(todos[0].status, "in_progress");
    assert_eq!(h.count(AIEventType::TodoCreated), 1);
}
