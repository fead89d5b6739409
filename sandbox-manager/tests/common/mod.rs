#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    CpuThrottle, DiskUsageProvider, MetricsCollector, PreviewServer, ProcessStats,
    ProcessStatsProvider, Result, SandboxError, SandboxEvent, TerminalMultiplexer,
};
use sandbox_manager::{Backends, FailureMarkerPolicy, ManagerConfig, SandboxManager};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Fake terminal multiplexer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTerminal {
    pub sessions: Mutex<HashMap<String, PathBuf>>,
    pub sent: Mutex<Vec<(String, PathBuf, String)>>,
    pub killed: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_send: AtomicBool,
    /// Reported as the shell pid of every session.
    pub shell_pid: Mutex<Option<u32>>,
    /// SIGKILL the shell pid when its session is killed, like tmux hanging
    /// up the pane.
    pub hangup_shell: AtomicBool,
    pub send_delay: Mutex<Duration>,
}

impl FakeTerminal {
    pub fn has_session(&self, name: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(name)
    }

    pub fn add_session(&self, name: &str) {
        self.sessions
            .lock()
            .unwrap()
            .insert(name.to_string(), PathBuf::from("/"));
    }
}

#[async_trait]
impl TerminalMultiplexer for FakeTerminal {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, session: &str, working_dir: &Path) -> Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Terminal("create refused".into()));
        }
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(session) {
            return Err(SandboxError::Terminal(format!("duplicate session: {session}")));
        }
        sessions.insert(session.to_string(), working_dir.to_path_buf());
        Ok(())
    }

    async fn send_command(&self, session: &str, working_dir: &Path, command: &str) -> Result<()> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(SandboxError::Terminal("send refused".into()));
        }
        if !self.has_session(session) {
            return Err(SandboxError::Terminal(format!("no session: {session}")));
        }
        self.sent.lock().unwrap().push((
            session.to_string(),
            working_dir.to_path_buf(),
            command.to_string(),
        ));
        Ok(())
    }

    async fn kill(&self, session: &str) -> Result<()> {
        if self.hangup_shell.load(Ordering::SeqCst)
            && let Some(pid) = *self.shell_pid.lock().unwrap()
        {
            sandbox_host::force_kill(pid);
        }
        self.sessions.lock().unwrap().remove(session);
        self.killed.lock().unwrap().push(session.to_string());
        Ok(())
    }

    async fn list_sessions(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .sessions
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn shell_pid(&self, _session: &str) -> Result<Option<u32>> {
        Ok(*self.shell_pid.lock().unwrap())
    }
}

// ---------------------------------------------------------------------------
// Fake probes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeStats {
    pub by_pid: Mutex<HashMap<u32, ProcessStats>>,
}

#[async_trait]
impl ProcessStatsProvider for FakeStats {
    async fn stats(&self, pid: u32) -> Option<ProcessStats> {
        self.by_pid.lock().unwrap().get(&pid).copied()
    }
}

/// Reports the same usage for every directory.
#[derive(Default)]
pub struct FakeDisk {
    pub mb: AtomicU64,
}

#[async_trait]
impl DiskUsageProvider for FakeDisk {
    async fn usage_mb(&self, _path: &Path) -> u64 {
        self.mb.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeThrottle {
    pub calls: Mutex<Vec<(u32, u32)>>,
}

#[async_trait]
impl CpuThrottle for FakeThrottle {
    async fn throttle(&self, pid: u32, percent: u32) -> bool {
        self.calls.lock().unwrap().push((pid, percent));
        true
    }
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Collaborators {
    pub collecting: Mutex<HashSet<String>>,
    pub previews: Mutex<HashSet<String>>,
    pub fail_preview: AtomicBool,
}

#[async_trait]
impl MetricsCollector for Collaborators {
    async fn start_collecting(&self, sandbox_id: &str, _path: &Path) {
        self.collecting.lock().unwrap().insert(sandbox_id.to_string());
    }

    async fn stop_collecting(&self, sandbox_id: &str) {
        self.collecting.lock().unwrap().remove(sandbox_id);
    }
}

#[async_trait]
impl PreviewServer for Collaborators {
    async fn start_preview(&self, sandbox_id: &str, _path: &Path) -> Result<()> {
        if self.fail_preview.load(Ordering::SeqCst) {
            return Err(SandboxError::Execution("no dev server".into()));
        }
        self.previews.lock().unwrap().insert(sandbox_id.to_string());
        Ok(())
    }

    async fn stop_preview(&self, sandbox_id: &str) {
        self.previews.lock().unwrap().remove(sandbox_id);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub manager: Arc<SandboxManager>,
    pub terminal: Arc<FakeTerminal>,
    pub stats: Arc<FakeStats>,
    pub disk: Arc<FakeDisk>,
    pub throttle: Arc<FakeThrottle>,
    pub collaborators: Arc<Collaborators>,
    pub root: tempfile::TempDir,
}

impl Harness {
    pub fn setup() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut ManagerConfig)) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let mut config = ManagerConfig::new(root.path());
        config.kill_grace = Duration::from_millis(500);
        config.sample_interval = Duration::from_millis(50);
        tweak(&mut config);

        let terminal = Arc::new(FakeTerminal::default());
        let stats = Arc::new(FakeStats::default());
        let disk = Arc::new(FakeDisk::default());
        let throttle = Arc::new(FakeThrottle::default());
        let collaborators = Arc::new(Collaborators::default());
        let backends = Backends {
            terminal: terminal.clone(),
            process_stats: stats.clone(),
            disk_usage: disk.clone(),
            cpu_throttle: throttle.clone(),
            metrics: collaborators.clone(),
            preview: collaborators.clone(),
            test_policy: Arc::new(FailureMarkerPolicy::default()),
        };

        Self {
            manager: SandboxManager::new(config, backends),
            terminal,
            stats,
            disk,
            throttle,
            collaborators,
            root,
        }
    }

    pub fn project_dir(&self, user_id: &str, project_id: &str) -> PathBuf {
        self.root.path().join(user_id).join("projects").join(project_id)
    }
}

/// Every event currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SandboxEvent>) -> Vec<SandboxEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
