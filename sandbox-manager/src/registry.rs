use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sandbox::{
    ResourceLimits, ResourceUsage, Result, SandboxError, SandboxSession, SandboxStatus,
};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::tracked::TrackedPids;

/// Mutable part of a sandbox.
#[derive(Debug)]
pub(crate) struct EntryState {
    pub status: SandboxStatus,
    pub path: PathBuf,
    pub last_activity: DateTime<Utc>,
    pub usage: ResourceUsage,
}

/// A live sandbox as held by the manager.
pub(crate) struct SandboxEntry {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub terminal_session: String,
    pub limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    /// Held across every state transition; run, promote and destroy on the
    /// same sandbox are serialized through it.
    pub op: Mutex<()>,
    pub state: Mutex<EntryState>,
    pub tracked: TrackedPids,
    /// The terminal's shell. Tracked for accounting, but it goes away with
    /// its terminal session rather than through signal escalation.
    pub shell_pid: Option<u32>,
    pub expiry: AbortHandle,
}

impl SandboxEntry {
    pub(crate) async fn snapshot(&self) -> SandboxSession {
        let pids = self.tracked.lock().await.iter().copied().collect();
        let state = self.state.lock().await;
        SandboxSession {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
            path: state.path.clone(),
            terminal_session: self.terminal_session.clone(),
            status: state.status,
            created_at: self.created_at,
            last_activity: state.last_activity,
            limits: self.limits,
            usage: state.usage,
            pids,
        }
    }

    /// Record activity and optionally move to `status`. Stopped sandboxes
    /// are gone as far as callers are concerned.
    pub(crate) async fn begin(&self, status: Option<SandboxStatus>) -> Result<PathBuf> {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return Err(SandboxError::NotFound(self.id.clone()));
        }
        if let Some(status) = status {
            state.status = status;
        }
        state.last_activity = Utc::now();
        Ok(state.path.clone())
    }

    /// Move to `status` unless the sandbox was stopped in the meantime.
    pub(crate) async fn settle(&self, status: SandboxStatus) {
        let mut state = self.state.lock().await;
        if !state.status.is_terminal() {
            state.status = status;
            state.last_activity = Utc::now();
        }
    }

    /// Mark stopped. Returns the directory, or `None` if already stopped.
    pub(crate) async fn stop(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return None;
        }
        state.status = SandboxStatus::Stopped;
        Some(state.path.clone())
    }
}

/// Id-keyed sandbox map plus per-user creation reservations.
///
/// A reservation holds a quota slot while a sandbox is being allocated, so
/// concurrent creations for one user cannot overshoot the cap.
#[derive(Default)]
pub(crate) struct Registry {
    sessions: HashMap<String, Arc<SandboxEntry>>,
    reserved: HashMap<String, usize>,
}

impl Registry {
    pub(crate) fn count_for(&self, user_id: &str) -> usize {
        let live = self
            .sessions
            .values()
            .filter(|e| e.user_id == user_id)
            .count();
        live + self.reserved.get(user_id).copied().unwrap_or(0)
    }

    pub(crate) fn reserve(&mut self, user_id: &str, limit: usize) -> Result<()> {
        if self.count_for(user_id) >= limit {
            return Err(SandboxError::Capacity {
                user_id: user_id.to_string(),
                limit,
            });
        }
        *self.reserved.entry(user_id.to_string()).or_default() += 1;
        Ok(())
    }

    pub(crate) fn release(&mut self, user_id: &str) {
        if let Some(count) = self.reserved.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.reserved.remove(user_id);
            }
        }
    }

    pub(crate) fn insert(&mut self, entry: Arc<SandboxEntry>) {
        self.sessions.insert(entry.id.clone(), entry);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<SandboxEntry>> {
        self.sessions.get(id).cloned()
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<SandboxEntry>> {
        self.sessions.remove(id)
    }

    pub(crate) fn entries(&self) -> Vec<Arc<SandboxEntry>> {
        self.sessions.values().cloned().collect()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub(crate) fn owns_terminal(&self, session: &str) -> bool {
        self.sessions
            .values()
            .any(|e| e.terminal_session == session)
    }
}
