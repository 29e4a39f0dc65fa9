//! Shared utilities used by the engine drivers and the session drain loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Windows constant to hide console windows when spawning CLI subprocesses.
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Buffer size of the raw line channel between a driver and the drain loop.
pub const RAW_CHANNEL_CAPACITY: usize = 256;

pub type TaskSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

pub type ChildSlot = Arc<Mutex<Option<Child>>>;

pub fn new_task_slot() -> TaskSlot {
    Arc::new(Mutex::new(None))
}

/// Cancel and await a background task stored in a [`TaskSlot`].
pub async fn abort_task_slot(slot: &TaskSlot) {
    let handle = {
        let mut guard = slot.lock().await;
        guard.take()
    };
    if let Some(handle) = handle {
        handle.abort();
        let _ = handle.await;
    }
}

/// Wait up to `timeout` for the task in `slot` to finish on its own, aborting it
/// if it does not.
pub async fn join_task_slot(slot: &TaskSlot, timeout: Duration) {
    let handle = {
        let mut guard = slot.lock().await;
        guard.take()
    };
    let Some(mut handle) = handle else {
        return;
    };
    if tokio::time::timeout(timeout, &mut handle).await.is_err() {
        log::warn!("background task did not finish within {timeout:?}, aborting");
        handle.abort();
        let _ = handle.await;
    }
}

/// Kill the child process in `slot`, if any, and reap it.
pub async fn kill_child(slot: &ChildSlot, label: &'static str) {
    let child = {
        let mut guard = slot.lock().await;
        guard.take()
    };
    if let Some(mut child) = child {
        if let Ok(Some(status)) = child.try_wait() {
            log::debug!("[{label}] process already exited with {status}");
            return;
        }
        match child.kill().await {
            Ok(()) => log::debug!("[{label}] process killed"),
            Err(e) => log::warn!("[{label}] failed to kill process: {e}"),
        }
    }
}

/// Run `<cli> --version` and return its trimmed output when the binary exists
/// and exits successfully.
pub async fn cli_version(cli_path: &str) -> Option<String> {
    let mut cmd = tokio::process::Command::new(cli_path);
    cmd.arg("--version")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    #[cfg(target_os = "windows")]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let output = tokio::time::timeout(Duration::from_secs(10), cmd.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Spawn a tokio task that drains a pipe line-by-line, logging non-empty lines.
///
/// Prevents deadlock when the child process writes faster than we consume it.
pub fn spawn_log_drain<R>(reader: R, label: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await.unwrap_or(None) {
            if !line.trim().is_empty() {
                log::debug!("[{label}] {}", line.trim());
            }
        }
    })
}

/// Forward non-empty lines from `reader` into `tx` until EOF, a read error, or
/// the receiving side hanging up.
pub async fn forward_lines<R>(reader: R, tx: &mpsc::Sender<String>, label: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = tokio::io::BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    log::debug!("[{label}] receiver dropped, stopping reader");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[{label}] read error: {e}");
                break;
            }
        }
    }
}
