use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sandbox::MetricsCollector;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Serialize)]
struct ActiveSandbox<'a> {
    id: &'a str,
    path: &'a Path,
}

#[derive(Debug, Serialize)]
struct RunnerStatus<'a> {
    mode: RunnerMode,
    active_sandboxes: usize,
    sandboxes: Vec<ActiveSandbox<'a>>,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// Serialize as ISO 8601 with millisecond precision, matching JS `Date.toISOString()`.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Thread-safe status tracker that persists state to a JSON file atomically.
///
/// Registered with the manager as its metrics collector, so the file always
/// lists the sandboxes that are currently live.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: RunnerMode,
    sandboxes: BTreeMap<String, PathBuf>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: RunnerMode::Running,
                sandboxes: BTreeMap::new(),
            }),
        }
    }

    pub async fn set_mode(&self, mode: RunnerMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    pub async fn add_sandbox(&self, id: &str, path: &Path) {
        let mut state = self.state.lock().await;
        state.sandboxes.insert(id.to_string(), path.to_path_buf());
        self.write_status(&state).await;
    }

    pub async fn remove_sandbox(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.sandboxes.remove(id);
        self.write_status(&state).await;
    }

    /// Write the initial status file.
    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    /// Atomic write: write to a temp file in the same directory, then rename.
    async fn write_status(&self, state: &MutableState) {
        let status = RunnerStatus {
            mode: state.mode,
            active_sandboxes: state.sandboxes.len(),
            sandboxes: state
                .sandboxes
                .iter()
                .map(|(id, path)| ActiveSandbox { id, path })
                .collect(),
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        if let Some(parent) = self.path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(error = %e, path = %parent.display(), "failed to create status directory");
            return;
        }
        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to rename status file");
        }
    }
}

#[async_trait]
impl MetricsCollector for StatusTracker {
    async fn start_collecting(&self, sandbox_id: &str, path: &Path) {
        self.add_sandbox(sandbox_id, path).await;
    }

    async fn stop_collecting(&self, sandbox_id: &str) {
        self.remove_sandbox(sandbox_id).await;
    }
}
