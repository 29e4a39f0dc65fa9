//! Integration tests against the real Claude Code CLI.
//!
//! These tests run the installed `claude` CLI (Haiku) through the runtime: the
//! registry spawns it, the Claude parser normalizes its stream-json output, and
//! the assertions look only at canonical events on the bus.
//!
//! All tests are `#[ignore]`: they require a working `claude` CLI and auth, and
//! they cost real API tokens.
//!
//! Run with:
//! ```bash
//! cargo test --test cli_verify -- --ignored --nocapture --test-threads=1
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use polaris_lib::events::{AIEvent, AIEventKind, AIEventType};
use polaris_lib::{AITask, EngineId, EngineRegistry, EventBus, RuntimeConfig, SessionConfig};

// ============================================================================
// Test Harness
// ============================================================================

/// Events collected from one prompt run against the CLI.
struct RunOutcome {
    events: Vec<AIEvent>,
    timed_out: bool,
}

impl RunOutcome {
    async fn run(prompt: &str) -> Self {
        Self::run_with_timeout(prompt, Duration::from_secs(120)).await
    }

    async fn run_with_timeout(prompt: &str, timeout: Duration) -> Self {
        let work_dir = tempfile::tempdir().expect("create temp dir");
        let bus = EventBus::new();
        let registry = EngineRegistry::with_defaults(&RuntimeConfig::default(), bus.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());
        let _collector = {
            let events = Arc::clone(&events);
            let done = Arc::clone(&done);
            bus.on_any(move |event| {
                events.lock().push(event.clone());
                if event.is_terminal() {
                    done.notify_one();
                }
                Ok(())
            })
        };

        let session = registry
            .create_session(&SessionConfig {
                engine: Some(EngineId::ClaudeCode),
                work_dir: Some(work_dir.path().to_path_buf()),
                model: Some("haiku".into()),
                ..SessionConfig::default()
            })
            .expect("create claude session");
        session.run(AITask::new(prompt)).await.expect("start task");

        let timed_out = tokio::time::timeout(timeout, done.notified()).await.is_err();
        if timed_out {
            eprintln!("  [harness] TIMEOUT after {timeout:?}");
        }
        registry.cleanup().await;

        let events = events.lock().clone();
        RunOutcome { events, timed_out }
    }

    fn print_event_summary(&self) {
        eprintln!("  [harness] {} events:", self.events.len());
        for event in &self.events {
            eprintln!("    {}", event.event_type());
        }
    }

    fn types(&self) -> Vec<AIEventType> {
        self.events.iter().map(AIEvent::event_type).collect()
    }

    fn position(&self, event_type: AIEventType) -> Option<usize> {
        self.types().iter().position(|t| *t == event_type)
    }

    fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e.kind() {
                AIEventKind::AssistantMessage { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn tool_names(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e.kind() {
                AIEventKind::ToolCallStart { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    fn ended_normally(&self) -> bool {
        !self.timed_out
            && self.events.iter().any(|e| {
                matches!(e.kind(), AIEventKind::SessionEnd { reason, .. } if reason != "aborted")
            })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_basic_text() {
    eprintln!("\n--- test_basic_text ---");
    let h = RunOutcome::run("Reply with exactly: PONG").await;
    h.print_event_summary();

    assert!(h.ended_normally(), "Missing session_end: {:?}", h.types());
    assert!(h.text().contains("PONG"), "Unexpected text: {}", h.text());
    assert_eq!(h.position(AIEventType::UserMessage), Some(0));
    assert!(h.position(AIEventType::SessionStart).is_some(), "Missing session_start");
    assert!(h.position(AIEventType::TokenUsage).is_some(), "Missing token usage");
    assert_eq!(h.types().last(), Some(&AIEventType::SessionEnd));
}

#[tokio::test]
#[ignore]
async fn test_tool_bash_round_trip() {
    eprintln!("\n--- test_tool_bash_round_trip ---");
    let h = RunOutcome::run("Run: echo hello_from_test. Use the Bash tool.").await;
    h.print_event_summary();

    assert!(h.ended_normally());
    assert!(
        h.tool_names().iter().any(|n| n == "Bash"),
        "Missing Bash tool call. Tools seen: {:?}",
        h.tool_names()
    );

    let start = h.position(AIEventType::ToolCallStart).expect("tool_call_start");
    let end = h.position(AIEventType::ToolCallEnd).expect("tool_call_end");
    assert!(start < end, "tool end before start: {:?}", h.types());

    let succeeded = h.events.iter().any(|e| {
        matches!(e.kind(), AIEventKind::ToolCallEnd { name, success: true, .. } if name == "Bash")
    });
    assert!(succeeded, "Bash call did not succeed");
}

#[tokio::test]
#[ignore]
async fn test_tool_call_ids_match() {
    eprintln!("\n--- test_tool_call_ids_match ---");
    let h = RunOutcome::run("Read the file /etc/shells and tell me how many lines it has. Use the Read tool.").await;
    h.print_event_summary();

    let started: Vec<&str> = h
        .events
        .iter()
        .filter_map(|e| match e.kind() {
            AIEventKind::ToolCallStart { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    let ended: Vec<&str> = h
        .events
        .iter()
        .filter_map(|e| match e.kind() {
            AIEventKind::ToolCallEnd { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    assert!(!started.is_empty(), "No tool calls: {:?}", h.types());
    for id in &ended {
        assert!(started.contains(id), "tool_call_end {id} has no matching start");
    }
}

#[tokio::test]
#[ignore]
async fn test_abort_running_task() {
    eprintln!("\n--- test_abort_running_task ---");
    let work_dir = tempfile::tempdir().expect("create temp dir");
    let bus = EventBus::new();
    let registry = EngineRegistry::with_defaults(&RuntimeConfig::default(), bus.clone());
    let ends = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let ends = Arc::clone(&ends);
        bus.on(AIEventType::SessionEnd, move |event| {
            if let AIEventKind::SessionEnd { reason, .. } = event.kind() {
                ends.lock().push(reason.clone());
            }
            Ok(())
        })
    };

    let session = registry
        .create_session(&SessionConfig {
            engine: Some(EngineId::ClaudeCode),
            work_dir: Some(work_dir.path().to_path_buf()),
            model: Some("haiku".into()),
            ..SessionConfig::default()
        })
        .expect("create claude session");
    let task = AITask::new("Count slowly from 1 to 200, one number per line.");
    let task_id = task.id.clone();
    session.run(task).await.expect("start task");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(session.abort(Some(&task_id)).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(*ends.lock(), vec!["aborted".to_string()]);
    registry.cleanup().await;
}
