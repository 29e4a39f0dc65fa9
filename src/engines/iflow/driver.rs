//! Runs the IFlow CLI and follows its session transcript.
//!
//! IFlow in `--prompt` mode prints plain text, so the structured record stream is
//! read from the `session-*.jsonl` transcript it appends to under
//! `~/.iflow/projects/<encoded>/`.
//! The session id is announced on stderr; once seen, the driver emits a synthetic
//! `session_start` line and tails the transcript until the process exits.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};

use crate::config::IFlowSettings;
use crate::engines::session::{EngineDriver, RawStream};
use crate::engines::types::{AITask, EngineError};
use crate::engines::utils::{
    abort_task_slot, kill_child, new_task_slot, spawn_log_drain, ChildSlot, TaskSlot,
    RAW_CHANNEL_CAPACITY,
};
use crate::events::{AIEvent, AIEventKind};

const FILE_WAIT_ATTEMPTS: u32 = 50;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Records read from a candidate transcript when matching its session id.
const HEADER_LINES: usize = 10;

fn session_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"session-[a-f0-9-]+").ok())
        .as_ref()
}

/// Finds an IFlow session id (`session-<hex>`) in a line of CLI output.
pub fn extract_session_id(text: &str) -> Option<String> {
    session_id_pattern()?
        .find(text)
        .map(|m| m.as_str().to_string())
}

/// IFlow's directory name for a project: drive colons dropped, separators turned
/// into `-`, then a `-` prefix (`/home/me/app` -> `--home-me-app`).
pub fn encode_project_path(work_dir: &Path) -> String {
    let normalized = work_dir
        .to_string_lossy()
        .replace(':', "")
        .replace(['\\', '/'], "-");
    format!("-{normalized}")
}

pub fn default_projects_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".iflow").join("projects"))
}

/// Directory holding the transcripts for `work_dir`.
pub fn project_dir(projects_dir: &Path, work_dir: &Path) -> PathBuf {
    projects_dir.join(encode_project_path(work_dir))
}

/// Whether one of the first lines of the file at `path` carries `session_id`.
async fn transcript_belongs_to(path: &Path, session_id: &str) -> bool {
    let Ok(file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut lines = BufReader::new(file).lines();
    for _ in 0..HEADER_LINES {
        let Ok(Some(line)) = lines.next_line().await else {
            return false;
        };
        let record: serde_json::Value = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(_) => continue,
        };
        if record.get("sessionId").and_then(|v| v.as_str()) == Some(session_id) {
            return true;
        }
    }
    false
}

/// Finds the transcript of `session_id` among the `session-*.jsonl` files in
/// `project_dir`. File names do not follow the id, so each candidate's first
/// records are matched against `sessionId`.
pub async fn find_transcript(project_dir: &Path, session_id: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(project_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_candidate = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("session-") && name.ends_with(".jsonl"));
        if is_candidate && transcript_belongs_to(&path, session_id).await {
            return Some(path);
        }
    }
    None
}

fn error_record(message: impl Into<String>) -> String {
    serde_json::json!({"type": "error", "message": message.into()}).to_string()
}

fn session_start_record(session_id: &str) -> String {
    serde_json::json!({"type": "session_start", "session_id": session_id}).to_string()
}

/// Polls [`find_transcript`] until the session's file shows up, giving up
/// after `attempts` polls.
pub async fn wait_for_transcript(
    project_dir: &Path,
    session_id: &str,
    attempts: u32,
    interval: Duration,
) -> Option<PathBuf> {
    for _ in 0..attempts {
        if let Some(path) = find_transcript(project_dir, session_id).await {
            return Some(path);
        }
        tokio::time::sleep(interval).await;
    }
    find_transcript(project_dir, session_id).await
}

async fn process_exited(child: &ChildSlot) -> bool {
    let mut guard = child.lock().await;
    match guard.as_mut() {
        Some(child) => !matches!(child.try_wait(), Ok(None)),
        None => true,
    }
}

/// Sends each complete line appended to `path` after `offset` until the process
/// in `child` has exited and the file is drained, or the receiver hangs up.
pub async fn tail_transcript(
    path: &Path,
    offset: u64,
    tx: &mpsc::Sender<String>,
    child: &ChildSlot,
) -> Result<(), std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut reader = BufReader::new(file);
    let mut pending = String::new();

    loop {
        let read = reader.read_line(&mut pending).await?;
        if read > 0 && pending.ends_with('\n') {
            let line = std::mem::take(&mut pending);
            if !line.trim().is_empty() && tx.send(line.trim_end().to_string()).await.is_err() {
                log::debug!("[iflow] receiver dropped, stopping transcript tail");
                return Ok(());
            }
            continue;
        }
        if read > 0 {
            // Partial line; the writer has not finished it yet.
            continue;
        }
        if process_exited(child).await {
            if !pending.trim().is_empty() {
                let _ = tx.send(pending.trim_end().to_string()).await;
            }
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub struct IFlowDriver {
    settings: IFlowSettings,
    work_dir: PathBuf,
    child: ChildSlot,
    reader_task: TaskSlot,
    stdout_task: TaskSlot,
    session_id: SyncMutex<Option<String>>,
}

impl IFlowDriver {
    pub fn new(settings: IFlowSettings, work_dir: PathBuf) -> Self {
        Self {
            settings,
            work_dir,
            child: Arc::new(Mutex::new(None)),
            reader_task: new_task_slot(),
            stdout_task: new_task_slot(),
            session_id: SyncMutex::new(None),
        }
    }

    pub fn build_args(prompt: &str, resume: Option<&str>) -> Vec<String> {
        let mut args = vec!["--yolo".to_string()];
        if let Some(id) = resume {
            args.push("--resume".into());
            args.push(id.to_string());
        }
        args.push("--prompt".into());
        args.push(prompt.to_string());
        args
    }

    fn projects_dir(&self) -> Result<PathBuf, EngineError> {
        self.settings
            .projects_dir
            .clone()
            .or_else(default_projects_dir)
            .ok_or_else(|| EngineError::transport("Could not locate the IFlow projects directory"))
    }
}

/// Reads stderr until a session id shows up, then hands the rest of the pipe to
/// a log drain. Falls back to `known` (the resumed id) when stderr closes first.
async fn discover_session_id(
    stderr: ChildStderr,
    known: Option<String>,
) -> (Option<String>, Option<tokio::task::JoinHandle<()>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            log::debug!("[iflow stderr] {}", line.trim());
        }
        if let Some(id) = extract_session_id(&line) {
            let rest = spawn_log_drain(lines.into_inner(), "iflow stderr");
            return (Some(id), Some(rest));
        }
    }
    (known, None)
}

#[async_trait]
impl EngineDriver for IFlowDriver {
    async fn start(&self, task: &AITask, resume: Option<String>) -> Result<RawStream, EngineError> {
        kill_child(&self.child, "iflow").await;
        abort_task_slot(&self.reader_task).await;
        abort_task_slot(&self.stdout_task).await;

        let project_dir = project_dir(&self.projects_dir()?, &self.work_dir);
        // When resuming, only lines appended by this run are new.
        let offset = match resume.as_deref() {
            Some(id) => match find_transcript(&project_dir, id).await {
                Some(path) => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
                None => 0,
            },
            None => 0,
        };

        let args = Self::build_args(&task.prompt_with_files(), resume.as_deref());
        log::info!(
            "[iflow] spawning {} in {} (resume: {})",
            self.settings.cli_path,
            self.work_dir.display(),
            resume.as_deref().unwrap_or("none")
        );
        let mut cmd = Command::new(&self.settings.cli_path);
        cmd.args(&args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(target_os = "windows")]
        cmd.creation_flags(crate::engines::utils::CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::transport(format!(
                "Failed to start IFlow CLI ({}): {e}",
                self.settings.cli_path
            ))
        })?;
        if let Some(stdout) = child.stdout.take() {
            *self.stdout_task.lock().await = Some(spawn_log_drain(stdout, "iflow stdout"));
        }
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::transport("IFlow CLI stderr unavailable"))?;
        *self.child.lock().await = Some(child);

        let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let child_slot = Arc::clone(&self.child);
        let reader = tokio::spawn(async move {
            let (session_id, stderr_drain) = discover_session_id(stderr, resume).await;
            let Some(session_id) = session_id else {
                let _ = tx
                    .send(error_record("IFlow did not report a session id"))
                    .await;
                return;
            };
            log::info!("[iflow] session id {session_id}");
            if tx.send(session_start_record(&session_id)).await.is_err() {
                return;
            }

            let found =
                wait_for_transcript(&project_dir, &session_id, FILE_WAIT_ATTEMPTS, POLL_INTERVAL)
                    .await;
            let Some(path) = found else {
                log::warn!(
                    "[iflow] no transcript for {session_id} in {}",
                    project_dir.display()
                );
                let _ = tx
                    .send(error_record(format!(
                        "IFlow session file was not created in {}",
                        project_dir.display()
                    )))
                    .await;
                return;
            };
            if let Err(e) = tail_transcript(&path, offset, &tx, &child_slot).await {
                log::warn!("[iflow] failed to read {}: {e}", path.display());
                let _ = tx
                    .send(error_record(format!("Failed to read IFlow session file: {e}")))
                    .await;
            }
            if let Some(drain) = stderr_drain {
                drain.abort();
            }
        });
        *self.reader_task.lock().await = Some(reader);

        Ok(rx)
    }

    fn observe(&self, event: &AIEvent) {
        if let AIEventKind::SessionStart { session_id } = event.kind() {
            *self.session_id.lock() = Some(session_id.clone());
        }
    }

    fn resume_handle(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    async fn cancel(&self) {
        kill_child(&self.child, "iflow").await;
        abort_task_slot(&self.reader_task).await;
    }

    async fn cleanup(&self) {
        self.cancel().await;
        abort_task_slot(&self.stdout_task).await;
        *self.session_id.lock() = None;
    }
}
