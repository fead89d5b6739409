use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sandbox::{ProcessExit, Result, SandboxError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Pids a sandbox owns. Teardown signals every member.
pub(crate) type TrackedPids = Arc<Mutex<BTreeSet<u32>>>;

const KILL_POLL: Duration = Duration::from_millis(100);

/// A process started inside a sandbox.
///
/// The process stays tracked by its sandbox until it exits, whether or not
/// the handle is kept. Dropping the handle does not kill the process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    exit: oneshot::Receiver<Option<i32>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for exit. `None` means the process was killed by a signal.
    pub async fn wait(self) -> Result<Option<i32>> {
        let pid = self.pid;
        self.exit
            .await
            .map_err(|_| SandboxError::Execution(format!("lost exit status of pid {pid}")))
    }

    /// Drain both output pipes and wait for exit.
    pub async fn wait_with_output(mut self) -> Result<ProcessExit> {
        let (stdout, stderr) = tokio::join!(drain(self.stdout.take()), drain(self.stderr.take()));
        let pid = self.pid;
        let exit_code = self.wait().await?;
        Ok(ProcessExit {
            pid,
            exit_code,
            stdout,
            stderr,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe
        && let Err(e) = pipe.read_to_end(&mut buf).await
    {
        debug!(error = %e, "output pipe closed early");
    }
    buf
}

/// What to start, and with which limits.
pub(crate) struct Launch<'a> {
    pub sandbox_id: &'a str,
    pub program: &'a str,
    pub args: &'a [String],
    pub dir: &'a Path,
    pub memory_mb: u64,
}

/// Spawn a process in its own process group, record its pid in `tracked`,
/// and untrack it once it exits.
pub(crate) async fn spawn(tracked: &TrackedPids, launch: Launch<'_>) -> Result<ProcessHandle> {
    let mut child = Command::new(launch.program)
        .args(launch.args)
        .current_dir(launch.dir)
        .env(
            "NODE_OPTIONS",
            format!("--max-old-space-size={}", launch.memory_mb),
        )
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            SandboxError::Execution(format!(
                "spawn {} in {}: {e}",
                launch.program, launch.sandbox_id
            ))
        })?;

    let pid = child.id().ok_or_else(|| {
        SandboxError::Execution(format!("{} exited before it was tracked", launch.program))
    })?;
    tracked.lock().await.insert(pid);
    debug!(sandbox_id = launch.sandbox_id, pid, program = launch.program, "process started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = oneshot::channel();
    let watched = Arc::clone(tracked);
    let sandbox_id = launch.sandbox_id.to_string();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(sandbox_id, pid, error = %e, "failed to wait for process");
                None
            }
        };
        watched.lock().await.remove(&pid);
        debug!(sandbox_id, pid, ?code, "process exited");
        let _ = tx.send(code);
    });

    Ok(ProcessHandle {
        pid,
        stdout,
        stderr,
        exit: rx,
    })
}

/// SIGTERM every tracked pid, wait up to `grace` for them to go, then
/// SIGKILL whatever is left. The set is empty afterwards.
pub(crate) async fn terminate_all(sandbox_id: &str, tracked: &TrackedPids, grace: Duration) {
    let pids: Vec<u32> = tracked.lock().await.iter().copied().collect();
    if pids.is_empty() {
        return;
    }
    for &pid in &pids {
        sandbox_host::terminate(pid);
    }

    let deadline = Instant::now() + grace;
    loop {
        let remaining = still_running(tracked).await;
        if remaining.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            for pid in remaining {
                warn!(sandbox_id, pid, "process ignored SIGTERM, sending SIGKILL");
                sandbox_host::force_kill(pid);
            }
            break;
        }
        tokio::time::sleep(KILL_POLL).await;
    }

    tracked.lock().await.clear();
    debug!(sandbox_id, count = pids.len(), "tracked processes terminated");
}

async fn still_running(tracked: &TrackedPids) -> Vec<u32> {
    let pids: Vec<u32> = tracked.lock().await.iter().copied().collect();
    pids.into_iter()
        .filter(|&pid| sandbox_host::is_alive(pid))
        .collect()
}
