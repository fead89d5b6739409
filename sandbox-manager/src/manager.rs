use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use sandbox::{
    CpuThrottle, Detached, DiskUsageProvider, MetricsCollector, PreviewServer,
    ProcessStatsProvider, ResourceLimits, ResourceUsage, Result, SandboxConfig, SandboxError,
    SandboxEvent, SandboxSession, SandboxStatus, TerminalMultiplexer,
};
use sandbox_host::{CpulimitThrottle, DuDiskUsage, PsStatsProvider, TmuxMultiplexer, WorkspaceStore};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::accounting::{self, Accountant};
use crate::checks::{self, FailureMarkerPolicy, TestKind, TestPlan, TestPolicy, TestReport};
use crate::config::ManagerConfig;
use crate::id::IdGenerator;
use crate::registry::{EntryState, Registry, SandboxEntry};
use crate::stats::ManagerStats;
use crate::tracked::{self, Launch, ProcessHandle, TrackedPids};

const EVENT_CAPACITY: usize = 256;

/// Host integrations the manager drives.
#[derive(Clone)]
pub struct Backends {
    pub terminal: Arc<dyn TerminalMultiplexer>,
    pub process_stats: Arc<dyn ProcessStatsProvider>,
    pub disk_usage: Arc<dyn DiskUsageProvider>,
    pub cpu_throttle: Arc<dyn CpuThrottle>,
    pub metrics: Arc<dyn MetricsCollector>,
    pub preview: Arc<dyn PreviewServer>,
    pub test_policy: Arc<dyn TestPolicy>,
}

impl Backends {
    /// tmux, `ps`, `du` and `cpulimit` on the local host, with no metrics
    /// collector or preview server attached.
    pub fn host(tmux_binary: PathBuf) -> Self {
        Self {
            terminal: Arc::new(TmuxMultiplexer::new(tmux_binary)),
            process_stats: Arc::new(PsStatsProvider),
            disk_usage: Arc::new(DuDiskUsage),
            cpu_throttle: Arc::new(CpulimitThrottle::detect()),
            metrics: Arc::new(Detached),
            preview: Arc::new(Detached),
            test_policy: Arc::new(FailureMarkerPolicy::default()),
        }
    }
}

/// Result of one orphan cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    /// Terminal sessions killed.
    pub sessions: Vec<String>,
    /// Sandbox directories removed.
    pub directories: Vec<PathBuf>,
}

/// Owns every live sandbox: creation, command execution, promotion,
/// teardown, expiry and resource accounting.
pub struct SandboxManager {
    config: ManagerConfig,
    backends: Backends,
    workspace: WorkspaceStore,
    accountant: Accountant,
    registry: Mutex<Registry>,
    events: broadcast::Sender<SandboxEvent>,
    ids: IdGenerator,
    sampler: Mutex<Option<JoinHandle<()>>>,
    this: Weak<SandboxManager>,
}

impl SandboxManager {
    pub fn new(config: ManagerConfig, backends: Backends) -> Arc<Self> {
        let workspace = WorkspaceStore::new(
            config.workspace_root.clone(),
            Arc::clone(&backends.disk_usage),
        );
        let accountant = Accountant::new(Arc::clone(&backends.process_stats));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            config,
            backends,
            workspace,
            accountant,
            registry: Mutex::new(Registry::default()),
            events,
            ids: IdGenerator::default(),
            sampler: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn workspace(&self) -> &WorkspaceStore {
        &self.workspace
    }

    /// Lifecycle and limit notifications. Events sent before subscribing are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SandboxEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Clean up leftovers of a previous run, then start periodic sampling.
    pub async fn start(&self) -> OrphanReport {
        let report = self.cleanup_orphans().await;
        self.start_sampler().await;
        report
    }

    pub async fn start_sampler(&self) {
        let mut slot = self.sampler.lock().await;
        if slot.is_some() {
            return;
        }
        let this = self.this.clone();
        let period = self.config.sample_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = this.upgrade() else {
                    break;
                };
                manager.sample_resources().await;
            }
        }));
        debug!(interval_ms = period.as_millis() as u64, "resource sampler started");
    }

    /// Allocate a new sandbox: directory, optional seed copy, terminal
    /// session, expiry timer.
    pub async fn create_sandbox(&self, request: SandboxConfig) -> Result<SandboxSession> {
        request.validate()?;
        self.registry
            .lock()
            .await
            .reserve(&request.user_id, self.config.max_per_user)?;

        let entry = match self.allocate(&request).await {
            Ok(entry) => entry,
            Err(e) => {
                self.registry.lock().await.release(&request.user_id);
                return Err(e);
            }
        };

        // Held until collaborators are running so a concurrent destroy sees
        // the sandbox fully started.
        let op = entry.op.lock().await;
        {
            let mut registry = self.registry.lock().await;
            registry.release(&request.user_id);
            registry.insert(Arc::clone(&entry));
        }

        let path = entry.state.lock().await.path.clone();
        self.backends.metrics.start_collecting(&entry.id, &path).await;
        if let Err(e) = self.backends.preview.start_preview(&entry.id, &path).await {
            warn!(sandbox_id = %entry.id, error = %e, "preview server failed to start");
        }

        let session = entry.snapshot().await;
        info!(
            sandbox_id = %session.id,
            user_id = %session.user_id,
            project_id = %session.project_id,
            path = %session.path.display(),
            "sandbox created"
        );
        self.emit(SandboxEvent::Created {
            session: Box::new(session.clone()),
        });
        drop(op);
        Ok(session)
    }

    async fn allocate(&self, request: &SandboxConfig) -> Result<Arc<SandboxEntry>> {
        let id = self.ids.next_id();
        let limits = request.limits(&self.config.defaults);

        let path = self
            .workspace
            .create_sandbox_dir(&request.user_id, &id)
            .await
            .map_err(|e| SandboxError::Allocation(format!("create directory for {id}: {e}")))?;

        if let Some(base) = &request.base_from {
            let source = self.workspace.paths().project(&request.user_id, base);
            match self.workspace.copy_workspace(&source, &path).await {
                Ok(files) => info!(sandbox_id = %id, base, files, "sandbox seeded from project"),
                Err(e) => warn!(
                    sandbox_id = %id,
                    base,
                    error = %e,
                    "could not seed sandbox, starting empty"
                ),
            }
        }

        // On failure the directory stays behind for orphan cleanup.
        let terminal_session = format!("{}{id}", self.config.session_prefix);
        self.backends
            .terminal
            .create(&terminal_session, &path)
            .await
            .map_err(|e| SandboxError::Allocation(format!("terminal session for {id}: {e}")))?;

        let shell_pid = match self.backends.terminal.shell_pid(&terminal_session).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!(sandbox_id = %id, error = %e, "could not read shell pid");
                None
            }
        };
        if let Some(pid) = shell_pid {
            self.limit_cpu(&id, pid, &limits).await;
        }

        let expiry = self.schedule_expiry(&id, Duration::from_secs(limits.time_limit_secs));
        let now = Utc::now();
        Ok(Arc::new(SandboxEntry {
            id,
            user_id: request.user_id.clone(),
            project_id: request.project_id.clone(),
            terminal_session,
            limits,
            created_at: now,
            op: Mutex::new(()),
            state: Mutex::new(EntryState {
                status: SandboxStatus::Ready,
                path,
                last_activity: now,
                usage: ResourceUsage::default(),
            }),
            tracked: Arc::new(Mutex::new(shell_pid.into_iter().collect::<BTreeSet<_>>())),
            shell_pid,
            expiry,
        }))
    }

    fn schedule_expiry(&self, id: &str, ttl: Duration) -> AbortHandle {
        let this = self.this.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            info!(sandbox_id = %id, "sandbox time limit reached");
            // Destroy aborts this timer; run it on its own task so it
            // cannot cancel itself halfway.
            tokio::spawn(async move { manager.destroy_sandbox(&id).await });
        })
        .abort_handle()
    }

    async fn limit_cpu(&self, id: &str, pid: u32, limits: &ResourceLimits) {
        if !self
            .backends
            .cpu_throttle
            .throttle(pid, limits.cpu_percent)
            .await
        {
            debug!(sandbox_id = id, pid, "cpu limiting unavailable");
        }
    }

    async fn entry(&self, id: &str) -> Result<Arc<SandboxEntry>> {
        self.registry
            .lock()
            .await
            .get(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    /// Type `command` into the sandbox's terminal session. Output is not
    /// captured.
    pub async fn run_in_sandbox(&self, id: &str, command: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        let _op = entry.op.lock().await;
        let path = entry.begin(Some(SandboxStatus::Running)).await?;

        match self
            .backends
            .terminal
            .send_command(&entry.terminal_session, &path, command)
            .await
        {
            Ok(()) => {
                entry.settle(SandboxStatus::Ready).await;
                debug!(sandbox_id = id, command, "command sent");
                Ok(())
            }
            Err(e) => {
                entry.settle(SandboxStatus::Error).await;
                warn!(sandbox_id = id, error = %e, "command failed");
                Err(SandboxError::Execution(format!("run in {id}: {e}")))
            }
        }
    }

    /// Start `program` directly (no shell) in the sandbox directory as a
    /// tracked process.
    pub async fn execute_in_sandbox(
        &self,
        id: &str,
        program: &str,
        args: &[String],
    ) -> Result<ProcessHandle> {
        let entry = self.entry(id).await?;
        let _op = entry.op.lock().await;
        let path = entry.begin(None).await?;
        self.spawn_tracked(&entry, &path, program, args).await
    }

    async fn spawn_tracked(
        &self,
        entry: &SandboxEntry,
        path: &Path,
        program: &str,
        args: &[String],
    ) -> Result<ProcessHandle> {
        let launch = Launch {
            sandbox_id: &entry.id,
            program,
            args,
            dir: path,
            memory_mb: entry.limits.memory_mb,
        };
        // The pid is tracked while the state lock is held, so a concurrent
        // destroy either sees it in teardown or stops us before the spawn.
        let handle = {
            let state = entry.state.lock().await;
            if state.status.is_terminal() {
                return Err(SandboxError::NotFound(entry.id.clone()));
            }
            tracked::spawn(&entry.tracked, launch).await?
        };
        self.limit_cpu(&entry.id, handle.pid(), &entry.limits).await;
        Ok(handle)
    }

    /// Run the sandbox's tests and judge them with the configured policy.
    ///
    /// The sandbox is only locked while changing state, so a destroy can
    /// interrupt a long test run.
    pub async fn test_sandbox(&self, id: &str) -> Result<TestReport> {
        let entry = self.entry(id).await?;
        let path = {
            let _op = entry.op.lock().await;
            entry.begin(Some(SandboxStatus::Running)).await?
        };

        let outcome = self.run_tests(&entry, &path).await;

        let _op = entry.op.lock().await;
        match &outcome {
            Ok(report) => {
                entry.settle(SandboxStatus::Ready).await;
                info!(sandbox_id = id, passed = report.passed, kind = ?report.kind, "tests finished");
            }
            Err(e) => {
                entry.settle(SandboxStatus::Error).await;
                warn!(sandbox_id = id, error = %e, "tests could not run");
            }
        }
        outcome
    }

    async fn run_tests(&self, entry: &SandboxEntry, path: &Path) -> Result<TestReport> {
        let config = &self.config.test;
        match checks::plan(path, config).await? {
            TestPlan::Project => {
                let args = vec!["-c".to_string(), config.command.clone()];
                let exit = self
                    .spawn_tracked(entry, path, "sh", &args)
                    .await?
                    .wait_with_output()
                    .await?;
                Ok(TestReport {
                    passed: self.backends.test_policy.passed(&exit),
                    kind: TestKind::Project,
                    output: exit.combined_output(),
                })
            }
            TestPlan::SyntaxCheck(files) => {
                let (program, leading) = checks::syntax_checker(config)?;
                let mut passed = true;
                let mut output = String::new();
                for file in files {
                    let mut args = leading.to_vec();
                    args.push(file.to_string_lossy().into_owned());
                    let exit = self
                        .spawn_tracked(entry, path, program, &args)
                        .await?
                        .wait_with_output()
                        .await?;
                    passed &= exit.success();
                    output.push_str(&exit.combined_output());
                }
                Ok(TestReport {
                    passed,
                    kind: TestKind::SyntaxCheck,
                    output,
                })
            }
            TestPlan::Empty => Ok(TestReport::empty()),
        }
    }

    /// Move the sandbox directory to `target` (default: the project
    /// directory it was created for) and retire the sandbox.
    ///
    /// An existing target is moved aside first. If the move fails the
    /// sandbox is left in `error` and can be retried or destroyed.
    pub async fn promote_sandbox(&self, id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let entry = self.entry(id).await?;
        let _op = entry.op.lock().await;
        let source = entry.begin(None).await?;
        let target = match target {
            Some(target) => target.to_path_buf(),
            None => self
                .workspace
                .paths()
                .project(&entry.user_id, &entry.project_id),
        };

        let backup = match self.workspace.relocate(&source, &target).await {
            Ok(backup) => backup,
            Err(e) => {
                entry.settle(SandboxStatus::Error).await;
                warn!(sandbox_id = id, error = %e, "promotion failed");
                return Err(SandboxError::Execution(format!(
                    "promote {id} to {}: {e}",
                    target.display()
                )));
            }
        };

        {
            let mut state = entry.state.lock().await;
            state.status = SandboxStatus::Stopped;
            state.path = target.clone();
        }
        self.teardown(&entry).await;
        self.registry.lock().await.remove(id);

        info!(
            sandbox_id = id,
            path = %target.display(),
            backup = ?backup,
            "sandbox promoted"
        );
        self.emit(SandboxEvent::Promoted {
            sandbox_id: id.to_string(),
            new_path: target.clone(),
        });
        Ok(target)
    }

    /// Tear down a sandbox and delete its directory. Unknown or already
    /// destroyed ids are a no-op.
    pub async fn destroy_sandbox(&self, id: &str) {
        let Ok(entry) = self.entry(id).await else {
            debug!(sandbox_id = id, "destroy of unknown sandbox ignored");
            return;
        };
        let _op = entry.op.lock().await;
        let Some(path) = entry.stop().await else {
            return;
        };

        self.teardown(&entry).await;
        self.workspace.remove_sandbox_dir(&path).await;
        self.registry.lock().await.remove(id);

        info!(sandbox_id = id, "sandbox destroyed");
        self.emit(SandboxEvent::Destroyed {
            sandbox_id: id.to_string(),
        });
    }

    /// Stop everything attached to a sandbox except its directory.
    ///
    /// The terminal goes first: killing the session hangs up its shell,
    /// which would otherwise sit out the whole grace period ignoring SIGTERM.
    async fn teardown(&self, entry: &SandboxEntry) {
        entry.expiry.abort();
        self.backends.metrics.stop_collecting(&entry.id).await;
        self.backends.preview.stop_preview(&entry.id).await;
        if let Err(e) = self.backends.terminal.kill(&entry.terminal_session).await {
            warn!(sandbox_id = %entry.id, error = %e, "failed to kill terminal session");
        }
        if let Some(pid) = entry.shell_pid {
            entry.tracked.lock().await.remove(&pid);
        }
        tracked::terminate_all(&entry.id, &entry.tracked, self.config.kill_grace).await;
    }

    pub async fn get(&self, id: &str) -> Option<SandboxSession> {
        let entry = self.registry.lock().await.get(id)?;
        let session = entry.snapshot().await;
        (!session.status.is_terminal()).then_some(session)
    }

    /// Live sandboxes, oldest first, optionally for one user.
    pub async fn list(&self, user_id: Option<&str>) -> Vec<SandboxSession> {
        let entries = self.registry.lock().await.entries();
        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            if user_id.is_some_and(|u| u != entry.user_id) {
                continue;
            }
            let session = entry.snapshot().await;
            if !session.status.is_terminal() {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub async fn stats(&self) -> ManagerStats {
        let sessions = self.list(None).await;
        ManagerStats::from_sessions(&sessions, self.config.max_per_user, Utc::now())
    }

    /// Measure every ready or running sandbox once, then emit one
    /// `LimitExceeded` per exceeded cap.
    pub async fn sample_resources(&self) {
        let entries = self.registry.lock().await.entries();
        for entry in entries {
            let path = {
                let state = entry.state.lock().await;
                if !state.status.is_sampled() {
                    continue;
                }
                state.path.clone()
            };
            let pids: Vec<u32> = entry.tracked.lock().await.iter().copied().collect();
            let sample = self.accountant.measure(&pids, &path, &self.workspace).await;
            if !sample.gone.is_empty() {
                prune(&entry.tracked, &sample.gone).await;
            }

            // Hold the state lock while emitting so no event follows a
            // concurrent destroy.
            let mut state = entry.state.lock().await;
            if state.status.is_terminal() {
                continue;
            }
            state.usage = sample.usage;
            for kind in accounting::exceeded(&sample.usage, &entry.limits) {
                warn!(
                    sandbox_id = %entry.id,
                    %kind,
                    memory_mb = sample.usage.memory_mb,
                    disk_mb = sample.usage.disk_mb,
                    "sandbox over limit"
                );
                self.emit(SandboxEvent::LimitExceeded {
                    sandbox_id: entry.id.clone(),
                    kind,
                });
            }
        }
    }

    /// Kill prefixed terminal sessions and remove stale sandbox directories
    /// that belong to no live sandbox.
    pub async fn cleanup_orphans(&self) -> OrphanReport {
        let mut report = OrphanReport::default();

        match self
            .backends
            .terminal
            .list_sessions(&self.config.session_prefix)
            .await
        {
            Ok(names) => {
                for name in names {
                    if self.registry.lock().await.owns_terminal(&name) {
                        continue;
                    }
                    match self.backends.terminal.kill(&name).await {
                        Ok(()) => {
                            info!(session = %name, "orphaned terminal session killed");
                            report.sessions.push(name);
                        }
                        Err(e) => warn!(session = %name, error = %e, "failed to kill orphan session"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list terminal sessions"),
        }

        for dir in self
            .workspace
            .stale_sandbox_dirs(self.config.orphan_max_age)
            .await
        {
            if self.registry.lock().await.contains(&dir.sandbox_id) {
                continue;
            }
            if self.workspace.remove_sandbox_dir(&dir.path).await {
                report.directories.push(dir.path);
            }
        }

        info!(
            sessions = report.sessions.len(),
            directories = report.directories.len(),
            "orphan cleanup finished"
        );
        report
    }

    /// Stop sampling and destroy every sandbox, all at once.
    pub async fn shutdown(&self) {
        if let Some(sampler) = self.sampler.lock().await.take() {
            sampler.abort();
        }
        let entries = self.registry.lock().await.entries();
        let count = entries.len();
        match self.this.upgrade() {
            Some(this) => {
                let mut destroys = JoinSet::new();
                for entry in entries {
                    let manager = Arc::clone(&this);
                    destroys.spawn(async move { manager.destroy_sandbox(&entry.id).await });
                }
                while let Some(joined) = destroys.join_next().await {
                    if let Err(e) = joined {
                        warn!(error = %e, "sandbox teardown task failed");
                    }
                }
            }
            // Only reachable while the last handle is being dropped.
            None => {
                for entry in entries {
                    self.destroy_sandbox(&entry.id).await;
                }
            }
        }
        info!(sandboxes = count, "sandbox manager shut down");
    }
}

async fn prune(tracked: &TrackedPids, gone: &[u32]) {
    let mut pids = tracked.lock().await;
    for pid in gone {
        pids.remove(pid);
    }
}
