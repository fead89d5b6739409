use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use sandbox::{ProcessStats, ProcessStatsProvider};

use crate::command::exec;

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. No-op if the child has already exited or the PID cannot
/// be represented as `i32`.
pub fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        force_kill(pid);
    }
}

/// Send SIGTERM to the process group led by `pid`, falling back to the
/// single process when `pid` is not a group leader.
pub fn terminate(pid: u32) -> bool {
    signal(pid, Signal::SIGTERM)
}

/// Send SIGKILL to the process group led by `pid`, falling back to the
/// single process.
pub fn force_kill(pid: u32) -> bool {
    signal(pid, Signal::SIGKILL)
}

/// Whether a process with `pid` exists (zombies included).
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn signal(pid: u32, signal: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let pid = Pid::from_raw(raw);
    killpg(pid, signal).is_ok() || kill(pid, signal).is_ok()
}

/// Process statistics read from `ps`.
pub struct PsStatsProvider;

/// Parse one `ps -o %cpu=,rss=` line: CPU percent and resident set size in KiB.
fn parse_ps_line(line: &str) -> Option<ProcessStats> {
    let mut fields = line.split_whitespace();
    let cpu_percent = fields.next()?.parse::<f64>().ok()?;
    let rss_kb = fields.next()?.parse::<u64>().ok()?;
    Some(ProcessStats {
        cpu_percent,
        memory_mb: rss_kb / 1024,
    })
}

#[async_trait]
impl ProcessStatsProvider for PsStatsProvider {
    async fn stats(&self, pid: u32) -> Option<ProcessStats> {
        let pid = pid.to_string();
        let output = exec("ps", &["-o", "%cpu=,rss=", "-p", &pid]).await.ok()?;
        output.lines().find_map(parse_ps_line)
    }
}
