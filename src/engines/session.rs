//! Session state machine shared by every engine.
//!
//! [`ManagedSession`] owns the lifecycle (`idle -> running -> idle | disposed`)
//! and delegates the backend half of the work to an [`EngineDriver`]. Backend
//! output is consumed by [`drain_events`], a standalone loop that feeds raw lines
//! through the session's parser and publishes the resulting events until a
//! terminating event appears.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::parser::EventParser;
use super::types::{AITask, EngineError, EngineId, SessionStatus};
use super::utils::{join_task_slot, new_task_slot, TaskSlot};
use crate::bus::{EventBus, HandlerResult, Subscription};
use crate::events::{
    create_error, create_session_end, create_user_message, AIEvent, AIEventKind, ToolCallInfo,
};

/// Raw backend records, one per line, in arrival order. The stream ends when
/// the driver drops its sender.
pub type RawStream = mpsc::Receiver<String>;

/// Upper bound on how long abort and dispose wait for backend-side teardown.
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Backend half of a session: starts work and tears it down.
#[async_trait]
pub trait EngineDriver: Send + Sync {
    /// Starts backend work for `task` and returns its raw output.
    ///
    /// `resume` is the engine-side conversation handle to continue, if any.
    async fn start(&self, task: &AITask, resume: Option<String>) -> Result<RawStream, EngineError>;

    /// Sees every event the session publishes for this driver's tasks, before
    /// subscribers do. Used to capture resume handles and conversation history.
    fn observe(&self, _event: &AIEvent) {}

    /// Handle to pass back into [`start`](Self::start) when continuing.
    fn resume_handle(&self) -> Option<String> {
        None
    }

    /// Stops the current backend call (kill the process, drop the HTTP stream).
    async fn cancel(&self);

    /// Releases everything the driver holds. Called once on dispose or timeout.
    async fn cleanup(&self);
}

/// One conversational run bound to one engine.
#[async_trait]
pub trait AISession: Send + Sync {
    /// Runtime id, unique per session and independent of the engine.
    fn id(&self) -> &str;

    fn engine_id(&self) -> EngineId;

    fn status(&self) -> SessionStatus;

    fn current_task_id(&self) -> Option<String>;

    /// Copy of the tool calls tracked for the current conversation.
    fn tool_calls_snapshot(&self) -> Vec<ToolCallInfo>;

    /// Registers a listener for this session's events only.
    fn on_event(&self, handler: Box<dyn Fn(&AIEvent) -> HandlerResult + Send + Sync>) -> Subscription;

    /// Accepts `task` and starts it. Returns once the backend has been started;
    /// completion is observed through events.
    async fn run(&self, task: AITask) -> Result<(), EngineError>;

    /// Starts a follow-up task in the same conversation. Returns the new task id.
    async fn continue_with(&self, prompt: String) -> Result<String, EngineError>;

    /// Flags the current task as aborted without waiting for the backend.
    ///
    /// Returns `false` when there is nothing to abort or `task_id` does not match
    /// the running task. Safe to call from an event handler.
    fn request_abort(&self, task_id: Option<&str>) -> bool;

    /// Aborts the current task and asks the backend to stop.
    async fn abort(&self, task_id: Option<&str>) -> bool;

    /// Permanently shuts the session down. Idempotent.
    async fn dispose(&self);
}

// ============================================================================
// Task control
// ============================================================================

/// Cancellation state for one running task.
pub struct TaskControl {
    task_id: String,
    aborted: AtomicBool,
    reason: Mutex<Option<&'static str>>,
    notify: Notify,
}

impl TaskControl {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Flags the task. Only the first request wins; later calls return `false`.
    pub fn request(&self, reason: &'static str) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.aborted.store(true, Ordering::Release);
        self.notify.notify_one();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn abort_reason(&self) -> Option<&'static str> {
        *self.reason.lock()
    }
}

// ============================================================================
// Drain loop
// ============================================================================

/// Publishes events to the shared bus and to a session's local listeners.
#[derive(Clone)]
pub struct EventSink {
    origin: String,
    bus: EventBus,
    local: EventBus,
}

impl EventSink {
    pub fn new(origin: impl Into<String>, bus: EventBus, local: EventBus) -> Self {
        Self {
            origin: origin.into(),
            bus,
            local,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Stamps the origin and delivers the event.
    pub fn publish(&self, event: AIEvent) {
        let event = event.with_origin(&self.origin);
        self.bus.emit(&event);
        self.local.emit(&event);
    }
}

/// How a drain loop ended.
#[derive(Debug)]
pub enum DrainOutcome {
    /// The parser produced a terminating event. It has not been published yet.
    Finished(AIEvent),
    /// The raw stream closed without a terminating event.
    Closed,
    /// The task was aborted; carries the abort reason.
    Aborted(&'static str),
    /// The deadline passed first.
    TimedOut,
}

/// Reads `raw` until a terminating event, abort, deadline, or end of stream.
///
/// Every produced event is stamped with the sink's origin, shown to `observe`,
/// and published in parser order, except the terminating one, which is handed
/// back in [`DrainOutcome::Finished`] so the caller can settle session state
/// before subscribers see it. Once the task is aborted nothing more is published.
pub async fn drain_events<T>(
    mut raw: RawStream,
    parser: &Mutex<Box<dyn EventParser>>,
    sink: &EventSink,
    control: &TaskControl,
    deadline: Option<Instant>,
    is_terminal: T,
    observe: &(dyn Fn(&AIEvent) + Send + Sync),
) -> DrainOutcome
where
    T: Fn(&AIEvent) -> bool,
{
    let timer = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    loop {
        if let Some(reason) = control.abort_reason() {
            return DrainOutcome::Aborted(reason);
        }

        let line = tokio::select! {
            biased;
            _ = control.notify.notified() => continue,
            _ = &mut timer => return DrainOutcome::TimedOut,
            line = raw.recv() => line,
        };
        let Some(line) = line else {
            return DrainOutcome::Closed;
        };

        let events = parser.lock().parse_line(&line);
        for event in events {
            if let Some(reason) = control.abort_reason() {
                return DrainOutcome::Aborted(reason);
            }
            let event = event.with_origin(sink.origin());
            observe(&event);
            if is_terminal(&event) {
                return DrainOutcome::Finished(event);
            }
            sink.publish(event);
        }
    }
}

// ============================================================================
// Managed session
// ============================================================================

struct SessionState {
    status: SessionStatus,
    current: Option<Arc<TaskControl>>,
    /// Resume handle supplied at creation, consumed by the first task.
    initial_resume: Option<String>,
}

/// Options for building a [`ManagedSession`].
pub struct SessionParts {
    pub id: String,
    pub engine_id: EngineId,
    pub supports_continue: bool,
    pub driver: Arc<dyn EngineDriver>,
    pub parser: Box<dyn EventParser>,
    pub bus: EventBus,
    pub task_timeout: Option<Duration>,
    pub resume_session_id: Option<String>,
}

/// [`AISession`] implementation used by every engine.
pub struct ManagedSession {
    id: String,
    engine_id: EngineId,
    supports_continue: bool,
    driver: Arc<dyn EngineDriver>,
    parser: Arc<Mutex<Box<dyn EventParser>>>,
    sink: EventSink,
    local: EventBus,
    state: Arc<Mutex<SessionState>>,
    task_timeout: Option<Duration>,
    drain_task: TaskSlot,
}

impl ManagedSession {
    pub fn new(parts: SessionParts) -> Self {
        let local = EventBus::new();
        Self {
            sink: EventSink::new(parts.id.clone(), parts.bus, local.clone()),
            id: parts.id,
            engine_id: parts.engine_id,
            supports_continue: parts.supports_continue,
            driver: parts.driver,
            parser: Arc::new(Mutex::new(parts.parser)),
            local,
            state: Arc::new(Mutex::new(SessionState {
                status: SessionStatus::Idle,
                current: None,
                initial_resume: parts.resume_session_id,
            })),
            task_timeout: parts.task_timeout,
            drain_task: new_task_slot(),
        }
    }

    async fn start_task(&self, task: AITask, fresh: bool) -> Result<(), EngineError> {
        let (control, resume, user_message) = {
            let mut state = self.state.lock();
            if state.status == SessionStatus::Disposed {
                return Err(EngineError::SessionDisposed);
            }
            if !state.status.can_transition_to(SessionStatus::Running) {
                let task_id = state
                    .current
                    .as_ref()
                    .map(|c| c.task_id().to_string())
                    .unwrap_or_default();
                return Err(EngineError::TaskActive { task_id });
            }
            let user_message = create_user_message(task.input.prompt.clone())?;
            let control = Arc::new(TaskControl::new(task.id.clone()));
            state.status = SessionStatus::Running;
            state.current = Some(Arc::clone(&control));
            let initial = state.initial_resume.take();
            let resume = if fresh {
                initial
            } else {
                self.driver.resume_handle().or(initial)
            };
            (control, resume, user_message)
        };

        if fresh {
            self.parser.lock().reset();
        }
        log::info!(
            "[{}] session {} starting task {}",
            self.engine_id,
            self.id,
            task.id
        );
        self.sink.publish(user_message);

        let raw = match self.driver.start(&task, resume).await {
            Ok(raw) => raw,
            // Aborted or disposed while starting: the backend call was cut short.
            Err(err) if control.is_aborted() => {
                let reason = control.abort_reason().unwrap_or("aborted");
                log::info!("[{}] task {} {reason} while starting: {err}", self.engine_id, task.id);
                settle(&self.state, &control);
                if let Ok(event) = create_session_end("", reason) {
                    self.driver.observe(&event);
                    self.sink.publish(event);
                }
                return Ok(());
            }
            Err(err) => {
                log::warn!("[{}] failed to start task {}: {}", self.engine_id, task.id, err);
                settle(&self.state, &control);
                if let Ok(event) = create_error(err.to_string()) {
                    self.sink.publish(event);
                }
                return Err(err);
            }
        };

        // Disposed while the backend was starting: its cleanup already ran. A
        // disposed session never starts another task, so this backend is ours.
        if control.abort_reason() == Some("disposed")
            && is_current(&self.state, &control)
            && tokio::time::timeout(CANCEL_TIMEOUT, self.driver.cleanup())
                .await
                .is_err()
        {
            log::warn!("[{}] cleanup after late start did not finish", self.engine_id);
        }

        let deadline = self.task_timeout.map(|t| Instant::now() + t);
        let handle = tokio::spawn(run_drain(DrainContext {
            raw,
            parser: Arc::clone(&self.parser),
            sink: self.sink.clone(),
            control,
            deadline,
            timeout: self.task_timeout,
            driver: Arc::clone(&self.driver),
            state: Arc::clone(&self.state),
            engine_id: self.engine_id,
        }));
        *self.drain_task.lock().await = Some(handle);
        Ok(())
    }
}

struct DrainContext {
    raw: RawStream,
    parser: Arc<Mutex<Box<dyn EventParser>>>,
    sink: EventSink,
    control: Arc<TaskControl>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    driver: Arc<dyn EngineDriver>,
    state: Arc<Mutex<SessionState>>,
    engine_id: EngineId,
}

fn is_current(state: &Mutex<SessionState>, control: &Arc<TaskControl>) -> bool {
    state
        .lock()
        .current
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, control))
}

/// Returns the session to idle if `control` is still its current task.
fn settle(state: &Mutex<SessionState>, control: &Arc<TaskControl>) {
    let mut state = state.lock();
    let owned = state
        .current
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, control));
    if owned {
        state.current = None;
        if state.status.can_transition_to(SessionStatus::Idle) {
            state.status = SessionStatus::Idle;
        }
    }
}

async fn run_drain(ctx: DrainContext) {
    let driver = Arc::clone(&ctx.driver);
    let observe = move |event: &AIEvent| driver.observe(event);
    let outcome = drain_events(
        ctx.raw,
        &ctx.parser,
        &ctx.sink,
        &ctx.control,
        ctx.deadline,
        AIEvent::is_terminal,
        &observe,
    )
    .await;

    let task_id = ctx.control.task_id();
    // Events produced by the parser were already shown to the driver.
    let mut synthesized = !matches!(outcome, DrainOutcome::Finished(_));
    let (final_event, timed_out) = match outcome {
        DrainOutcome::Finished(event) => (Ok(event), false),
        DrainOutcome::Closed => {
            log::debug!(
                "[{}] stream closed for task {task_id} without end event",
                ctx.engine_id
            );
            (create_session_end("", "completed"), false)
        }
        DrainOutcome::Aborted(reason) => {
            log::info!("[{}] task {task_id} {reason}", ctx.engine_id);
            (create_session_end("", reason), false)
        }
        DrainOutcome::TimedOut => {
            let secs = ctx.timeout.map(|t| t.as_secs()).unwrap_or_default();
            log::warn!("[{}] task {task_id} timed out after {secs}s", ctx.engine_id);
            (create_error(format!("Task timed out after {secs}s")), true)
        }
    };

    // The session still belongs to this task here, so the next task cannot
    // start until the backend is torn down.
    if timed_out
        && tokio::time::timeout(CANCEL_TIMEOUT, ctx.driver.cleanup())
            .await
            .is_err()
    {
        log::warn!("[{}] cleanup after timeout did not finish", ctx.engine_id);
    }

    settle(&ctx.state, &ctx.control);

    // An abort that landed after the loop returned still gets the aborted ending.
    let final_event = match (final_event, ctx.control.abort_reason()) {
        (Ok(event), Some(reason)) if !matches!(event.kind(), AIEventKind::SessionEnd { .. }) => {
            synthesized = true;
            create_session_end("", reason)
        }
        (event, _) => event,
    };
    match final_event {
        Ok(event) => {
            if synthesized {
                ctx.driver.observe(&event);
            }
            ctx.sink.publish(event);
        }
        Err(e) => log::error!("[{}] could not build final event: {e}", ctx.engine_id),
    }
}

#[async_trait]
impl AISession for ManagedSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    fn current_task_id(&self) -> Option<String> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|c| c.task_id().to_string())
    }

    fn tool_calls_snapshot(&self) -> Vec<ToolCallInfo> {
        self.parser.lock().tracker().get_tool_calls().to_vec()
    }

    fn on_event(&self, handler: Box<dyn Fn(&AIEvent) -> HandlerResult + Send + Sync>) -> Subscription {
        self.local.on_any(handler)
    }

    async fn run(&self, task: AITask) -> Result<(), EngineError> {
        self.start_task(task, true).await
    }

    async fn continue_with(&self, prompt: String) -> Result<String, EngineError> {
        if !self.supports_continue {
            return Err(EngineError::ContinueUnsupported(self.engine_id));
        }
        let task = AITask::new(prompt);
        let task_id = task.id.clone();
        self.start_task(task, false).await?;
        Ok(task_id)
    }

    fn request_abort(&self, task_id: Option<&str>) -> bool {
        let state = self.state.lock();
        if state.status != SessionStatus::Running {
            return false;
        }
        let Some(control) = state.current.as_ref() else {
            return false;
        };
        if let Some(requested) = task_id {
            if requested != control.task_id() {
                log::debug!(
                    "[{}] ignoring abort for stale task {requested} (running {})",
                    self.engine_id,
                    control.task_id()
                );
                return false;
            }
        }
        control.request("aborted")
    }

    async fn abort(&self, task_id: Option<&str>) -> bool {
        if !self.request_abort(task_id) {
            return false;
        }
        if tokio::time::timeout(CANCEL_TIMEOUT, self.driver.cancel())
            .await
            .is_err()
        {
            log::warn!("[{}] backend did not acknowledge cancel", self.engine_id);
        }
        true
    }

    async fn dispose(&self) {
        let running = {
            let mut state = self.state.lock();
            if !state.status.can_transition_to(SessionStatus::Disposed) {
                return;
            }
            state.status = SessionStatus::Disposed;
            state.current.clone()
        };
        if let Some(control) = running {
            control.request("disposed");
        }
        if tokio::time::timeout(CANCEL_TIMEOUT, self.driver.cleanup())
            .await
            .is_err()
        {
            log::warn!("[{}] cleanup did not finish during dispose", self.engine_id);
        }
        join_task_slot(&self.drain_task, CANCEL_TIMEOUT).await;
        self.parser.lock().reset();
        self.local.clear();
        log::info!("[{}] session {} disposed", self.engine_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::iflow::IFlowParser;
    use serde_json::json;

    fn parser() -> Mutex<Box<dyn EventParser>> {
        Mutex::new(Box::new(IFlowParser::new()))
    }

    fn recording_sink(origin: &str) -> (EventSink, Arc<Mutex<Vec<AIEvent>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        bus.on_any(move |event| {
            sink_seen.lock().push(event.clone());
            Ok(())
        });
        (EventSink::new(origin, bus, EventBus::new()), seen)
    }

    fn raw(lines: &[serde_json::Value]) -> (mpsc::Sender<String>, RawStream) {
        let (tx, rx) = mpsc::channel(lines.len() + 1);
        for line in lines {
            tx.try_send(line.to_string()).unwrap();
        }
        (tx, rx)
    }

    // ── task control ─────────────────────────────────────────────────────

    #[test]
    fn test_first_abort_request_wins() {
        let control = TaskControl::new("t1");
        assert!(!control.is_aborted());
        assert!(control.request("aborted"));
        assert!(!control.request("disposed"));
        assert!(control.is_aborted());
        assert_eq!(control.abort_reason(), Some("aborted"));
        assert_eq!(control.task_id(), "t1");
    }

    // ── drain loop ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_drain_publishes_until_terminal_event() {
        let (sink, seen) = recording_sink("s1");
        let (_tx, rx) = raw(&[
            json!({"type": "progress", "message": "one"}),
            json!({"type": "session_end", "reason": "completed"}),
            json!({"type": "progress", "message": "after end"}),
        ]);
        let observed = Mutex::new(0usize);
        let observe = |_: &AIEvent| *observed.lock() += 1;

        let outcome = drain_events(
            rx,
            &parser(),
            &sink,
            &TaskControl::new("t"),
            None,
            AIEvent::is_terminal,
            &observe,
        )
        .await;

        let end = match outcome {
            DrainOutcome::Finished(end) => end,
            other => panic!("expected Finished, got {other:?}"),
        };
        assert_eq!(end.origin(), Some("s1"));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(*observed.lock(), 2);
    }

    #[tokio::test]
    async fn test_drain_reports_closed_stream() {
        let (sink, seen) = recording_sink("s1");
        let (tx, rx) = raw(&[json!({"type": "progress", "message": "one"})]);
        drop(tx);

        let outcome = drain_events(
            rx,
            &parser(),
            &sink,
            &TaskControl::new("t"),
            None,
            AIEvent::is_terminal,
            &|_: &AIEvent| {},
        )
        .await;
        assert!(matches!(outcome, DrainOutcome::Closed));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_stops_publishing_once_aborted() {
        let (sink, seen) = recording_sink("s1");
        let (_tx, rx) = raw(&[json!({"type": "progress", "message": "late"})]);
        let control = TaskControl::new("t");
        control.request("aborted");

        let outcome = drain_events(
            rx,
            &parser(),
            &sink,
            &control,
            None,
            AIEvent::is_terminal,
            &|_: &AIEvent| {},
        )
        .await;
        assert!(matches!(outcome, DrainOutcome::Aborted("aborted")));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_on_silent_backend() {
        let (sink, _seen) = recording_sink("s1");
        let (_tx, rx) = raw(&[]);

        let outcome = drain_events(
            rx,
            &parser(),
            &sink,
            &TaskControl::new("t"),
            Some(Instant::now() + Duration::from_secs(3)),
            AIEvent::is_terminal,
            &|_: &AIEvent| {},
        )
        .await;
        assert!(matches!(outcome, DrainOutcome::TimedOut));
    }
}
