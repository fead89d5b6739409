use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;

/// Lifecycle state of a sandbox.
///
/// `creating -> ready <-> running -> stopped`, with `error` reachable from
/// `ready`/`running` when an operation fails. `stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Ready,
    Running,
    Stopped,
    Error,
}

impl SandboxStatus {
    /// Sessions in these states are sampled by resource accounting.
    pub fn is_sampled(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => f.write_str("creating"),
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Last measured resource consumption of a sandbox.
///
/// All zeros with `sampled_at == None` until the first accounting pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// CPU and resident memory of a single OS process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessStats {
    pub cpu_percent: f64,
    pub memory_mb: u64,
}

/// Which configured cap a sandbox went over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Memory,
    Disk,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Disk => f.write_str("disk"),
        }
    }
}

/// Point-in-time snapshot of a sandbox, as handed out to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSession {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub path: PathBuf,
    /// Name of the bound terminal-multiplexer session.
    pub terminal_session: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    /// Tracked process ids, ascending.
    pub pids: Vec<u32>,
}

/// Result of running a tracked process to completion.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub pid: u32,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_output(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_and_running_are_sampled() {
        assert!(SandboxStatus::Ready.is_sampled());
        assert!(SandboxStatus::Running.is_sampled());
        assert!(!SandboxStatus::Creating.is_sampled());
        assert!(!SandboxStatus::Error.is_sampled());
        assert!(!SandboxStatus::Stopped.is_sampled());
        assert!(SandboxStatus::Stopped.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SandboxStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(SandboxStatus::Error.to_string(), "error");
    }

    #[test]
    fn combined_output_joins_streams() {
        let exit = ProcessExit {
            pid: 1,
            exit_code: Some(0),
            stdout: b"ok\n".to_vec(),
            stderr: b"warn\n".to_vec(),
        };
        assert!(exit.success());
        assert_eq!(exit.combined_output(), "ok\nwarn\n");
    }

    #[test]
    fn signalled_exit_is_not_success() {
        let exit = ProcessExit {
            pid: 1,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert!(!exit.success());
    }
}
