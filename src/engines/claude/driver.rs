//! Runs the Claude Code CLI as a child process per task.
//!
//! Each task spawns `claude --print --verbose --output-format stream-json` with
//! the prompt as its final argument; stdout lines flow into the session's drain
//! loop. Continuation passes `--resume <cli session id>` captured from the
//! `system/init` record of the previous task.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use crate::config::ClaudeCodeSettings;
use crate::engines::session::{EngineDriver, RawStream};
use crate::engines::types::{AITask, EngineError};
use crate::engines::utils::{
    abort_task_slot, forward_lines, kill_child, new_task_slot, spawn_log_drain, ChildSlot,
    TaskSlot, RAW_CHANNEL_CAPACITY,
};
use crate::events::{AIEvent, AIEventKind};

/// How long to wait for the CLI to exit after stdout closes.
const EXIT_WAIT: Duration = Duration::from_secs(2);

pub struct ClaudeCliDriver {
    settings: ClaudeCodeSettings,
    work_dir: PathBuf,
    model: Option<String>,
    child: ChildSlot,
    reader_task: TaskSlot,
    stderr_task: TaskSlot,
    cli_session_id: SyncMutex<Option<String>>,
}

impl ClaudeCliDriver {
    pub fn new(settings: ClaudeCodeSettings, work_dir: PathBuf, model: Option<String>) -> Self {
        Self {
            settings,
            work_dir,
            model,
            child: Arc::new(Mutex::new(None)),
            reader_task: new_task_slot(),
            stderr_task: new_task_slot(),
            cli_session_id: SyncMutex::new(None),
        }
    }

    /// Arguments passed to the CLI for one task.
    pub fn build_args(&self, prompt: &str, resume: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--verbose".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--permission-mode".into(),
            self.settings.permission_mode.clone(),
        ];
        if let Some(model) = self.model.as_ref().or(self.settings.model.as_ref()) {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(id) = resume {
            args.push("--resume".into());
            args.push(id.to_string());
        }
        args.push(prompt.to_string());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.settings.cli_path);
        cmd.args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(git_bash) = &self.settings.git_bash_path {
            cmd.env("CLAUDE_CODE_GIT_BASH_PATH", git_bash);
        }
        #[cfg(target_os = "windows")]
        cmd.creation_flags(crate::engines::utils::CREATE_NO_WINDOW);
        cmd
    }
}

/// Record appended to the stream when the CLI exits unsuccessfully, so the
/// failure reaches subscribers through the normal parser path.
fn exit_failure_record(code: Option<i32>) -> String {
    let message = match code {
        Some(code) => format!("Claude CLI exited with status {code}"),
        None => "Claude CLI was terminated".to_string(),
    };
    serde_json::json!({
        "type": "result",
        "subtype": "error_during_execution",
        "is_error": true,
        "result": message,
    })
    .to_string()
}

#[async_trait]
impl EngineDriver for ClaudeCliDriver {
    async fn start(&self, task: &AITask, resume: Option<String>) -> Result<RawStream, EngineError> {
        // A previous task's process may still be winding down.
        kill_child(&self.child, "claude").await;
        abort_task_slot(&self.reader_task).await;
        abort_task_slot(&self.stderr_task).await;

        let args = self.build_args(&task.prompt_with_files(), resume.as_deref());
        log::info!(
            "[claude] spawning {} in {} (resume: {})",
            self.settings.cli_path,
            self.work_dir.display(),
            resume.as_deref().unwrap_or("none")
        );

        let mut child = self.command(&args).spawn().map_err(|e| {
            EngineError::transport(format!(
                "Failed to start Claude CLI ({}): {e}",
                self.settings.cli_path
            ))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::transport("Claude CLI stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            *self.stderr_task.lock().await = Some(spawn_log_drain(stderr, "claude stderr"));
        }
        *self.child.lock().await = Some(child);

        let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let child_slot = Arc::clone(&self.child);
        let reader = tokio::spawn(async move {
            forward_lines(stdout, &tx, "claude").await;

            let status = {
                let mut guard = child_slot.lock().await;
                match guard.as_mut() {
                    Some(child) => tokio::time::timeout(EXIT_WAIT, child.wait()).await.ok(),
                    None => None,
                }
            };
            match status {
                Some(Ok(status)) if !status.success() => {
                    log::warn!("[claude] process exited with {status}");
                    let _ = tx.send(exit_failure_record(status.code())).await;
                }
                Some(Ok(status)) => log::debug!("[claude] process exited with {status}"),
                Some(Err(e)) => log::warn!("[claude] failed to wait for process: {e}"),
                None => {}
            }
        });
        *self.reader_task.lock().await = Some(reader);

        Ok(rx)
    }

    fn observe(&self, event: &AIEvent) {
        if let AIEventKind::SessionStart { session_id } = event.kind() {
            *self.cli_session_id.lock() = Some(session_id.clone());
        }
    }

    fn resume_handle(&self) -> Option<String> {
        self.cli_session_id.lock().clone()
    }

    async fn cancel(&self) {
        kill_child(&self.child, "claude").await;
        abort_task_slot(&self.reader_task).await;
    }

    async fn cleanup(&self) {
        self.cancel().await;
        abort_task_slot(&self.stderr_task).await;
        *self.cli_session_id.lock() = None;
    }
}
