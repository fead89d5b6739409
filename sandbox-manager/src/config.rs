use std::path::PathBuf;
use std::time::Duration;

use sandbox::ResourceLimits;

use crate::checks::TestConfig;

pub const DEFAULT_MAX_PER_USER: usize = 5;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_ORPHAN_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SESSION_PREFIX: &str = "sandbox_";

/// Static settings for a [`SandboxManager`](crate::SandboxManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of all user workspaces. Sandboxes live under
    /// `<root>/<user>/sandboxes/<id>`, projects under `<root>/<user>/projects/<id>`.
    pub workspace_root: PathBuf,
    /// Maximum number of non-stopped sandboxes per user.
    pub max_per_user: usize,
    /// Limits applied where a creation request leaves a cap unset.
    pub defaults: ResourceLimits,
    pub sample_interval: Duration,
    /// Time between SIGTERM and SIGKILL when tearing down tracked processes.
    pub kill_grace: Duration,
    /// Sandbox directories with no live session are removed once older than this.
    pub orphan_max_age: Duration,
    /// Prefix of every terminal session name owned by the manager.
    pub session_prefix: String,
    pub test: TestConfig,
}

impl ManagerConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_per_user: DEFAULT_MAX_PER_USER,
            defaults: ResourceLimits::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            orphan_max_age: DEFAULT_ORPHAN_MAX_AGE,
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            test: TestConfig::default(),
        }
    }
}
