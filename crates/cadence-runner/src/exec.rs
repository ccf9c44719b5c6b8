//! Process execution with capped output capture.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::resolve::ResolvedCommand;

/// Soft cap on each captured stream. Past this the pipe is still drained so
/// the child never blocks, but the bytes are discarded.
pub const OUTPUT_CAP_BYTES: usize = 256 * 1024;

/// Appended to the capture when the cap was hit.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Outcome of one process execution.
///
/// Launch failures and non-zero exits are data, not errors: nothing escapes
/// this boundary, so one task's failure can never abort another's.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// True iff the process exited with status zero.
    pub success: bool,
    /// Combined stdout + stderr, capped.
    pub output: String,
    /// Why the run failed, when it did: non-zero exit, launch failure, or an
    /// environment that could not be resolved. `None` on success.
    pub reason: Option<String>,
    pub duration: Duration,
}

impl RunOutcome {
    /// A failure that never produced a process (launch or resolution error).
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            reason: Some(reason.into()),
            duration: Duration::ZERO,
        }
    }
}

/// Launch the resolved command in its working directory, wait for it to
/// finish, and capture its output.
pub async fn run(resolved: &ResolvedCommand) -> RunOutcome {
    let start = Instant::now();

    let Some((program, args)) = resolved.argv.split_first() else {
        return RunOutcome::failure("resolved command has an empty argv");
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&resolved.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if resolved.scrub_virtual_env {
        command.env_remove("VIRTUAL_ENV");
    }

    debug!(program = %program, args = ?args, cwd = %resolved.working_dir.display(), "spawning task process");

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let reason = if e.kind() == std::io::ErrorKind::NotFound {
                format!("executable not found: {program}")
            } else {
                format!("failed to launch {program}: {e}")
            };
            warn!(program = %program, error = %e, "task process failed to launch");
            return RunOutcome {
                duration: start.elapsed(),
                ..RunOutcome::failure(reason)
            };
        }
    };

    // Drain both pipes concurrently so a chatty child can't deadlock on a
    // full pipe while we wait on the other stream.
    let stdout_task = child
        .stdout
        .take()
        .map(|stream| tokio::spawn(read_capped(stream, OUTPUT_CAP_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stream| tokio::spawn(read_capped(stream, OUTPUT_CAP_BYTES)));

    let status = child.wait().await;

    let (stdout, stdout_truncated) = join_capture(stdout_task).await;
    let (stderr, stderr_truncated) = join_capture(stderr_task).await;

    let mut output = String::from_utf8_lossy(&stdout).into_owned();
    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&String::from_utf8_lossy(&stderr));
    }
    if stdout_truncated || stderr_truncated {
        output.push_str(TRUNCATION_MARKER);
    }

    let duration = start.elapsed();
    match status {
        Ok(status) if status.success() => RunOutcome {
            success: true,
            output,
            reason: None,
            duration,
        },
        Ok(status) => RunOutcome {
            success: false,
            output,
            reason: Some(match status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            }),
            duration,
        },
        Err(e) => RunOutcome {
            success: false,
            output,
            reason: Some(format!("failed to wait for {program}: {e}")),
            duration,
        },
    }
}

async fn join_capture(
    task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
) -> (Vec<u8>, bool) {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => (Vec::new(), false),
    }
}

/// Read a stream to exhaustion, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut captured = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < cap {
                    let take = n.min(cap - captured.len());
                    captured.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (captured, truncated)
}
