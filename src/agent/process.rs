//! Child processes for the stdio-based runtimes

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

/// Keep only the end of stderr for error messages
const STDERR_TAIL_CHARS: usize = 2000;

/// Spawns `command` with piped stdio. Returns `Ok(None)` when the
/// executable does not exist, so the caller can report the backend as not
/// configured.
pub fn spawn_piped(
    command: &str,
    args: &[String],
    working_dir: Option<&PathBuf>,
) -> Result<Option<Child>> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    tracing::debug!("Spawning {command} {}", args.join(" "));
    match cmd.spawn() {
        Ok(child) => Ok(Some(child)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Executable {command} not found");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to start {command}")),
    }
}

/// Drains stderr in the background so the child never blocks on a full pipe.
pub fn collect_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("agent stderr: {line}");
            tail.push_str(&line);
            tail.push('\n');
            if tail.len() > STDERR_TAIL_CHARS * 2 {
                let cut = tail.len() - STDERR_TAIL_CHARS;
                let cut = (cut..tail.len())
                    .find(|i| tail.is_char_boundary(*i))
                    .unwrap_or(tail.len());
                tail.drain(..cut);
            }
        }
        tail
    })
}

/// Error for a child that exited unsuccessfully
pub async fn exit_error(command: &str, status: ExitStatus, stderr: JoinHandle<String>) -> anyhow::Error {
    let tail = stderr.await.unwrap_or_default();
    let tail = tail.trim();
    if tail.is_empty() {
        anyhow::anyhow!("{command} exited with {status}")
    } else {
        anyhow::anyhow!("{command} exited with {status}: {tail}")
    }
}
