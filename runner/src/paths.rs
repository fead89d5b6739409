use std::path::PathBuf;

/// Runner-level files kept in the workspace root.
pub struct RunnerPaths {
    workspace_root: PathBuf,
}

impl RunnerPaths {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    pub fn status(&self) -> PathBuf {
        self.workspace_root.join("status.json")
    }

    /// Held by the runner that owns the workspace, so orphan cleanup never
    /// reaps another runner's sandboxes.
    pub fn lock(&self) -> PathBuf {
        self.workspace_root.join(".runner.lock")
    }
}
