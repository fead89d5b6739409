mod check;
mod cleanup;
mod run;
mod serve;

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use nix::fcntl::Flock;
use sandbox_host::CommandPreviewServer;
use sandbox_manager::{Backends, SandboxManager};
use tracing::info;

use crate::config::{self, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::lock;
use crate::status::StatusTracker;

pub use check::{CheckArgs, run_check};
pub use cleanup::{CleanupArgs, run_cleanup};
pub use run::{RunArgs, run_run};
pub use serve::{ServeArgs, run_serve};

/// A loaded config, the workspace lock, and a manager wired to the host.
pub(crate) struct Runtime {
    pub config: RunnerConfig,
    pub status: Arc<StatusTracker>,
    pub manager: Arc<SandboxManager>,
    _lock: Flock<File>,
}

/// Load the config, verify the host, lock the workspace and build the
/// manager. The manager is not started.
pub(crate) async fn prepare(config_path: &Path) -> RunnerResult<Runtime> {
    let config = config::load(config_path).await?;
    sandbox_host::check_prerequisites(&config.tmux.binary)?;

    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .map_err(|e| {
            RunnerError::Config(format!(
                "create workspace root {}: {e}",
                config.workspace_root.display()
            ))
        })?;
    let lock = lock::try_acquire(config.paths().lock()).await?;

    let status = Arc::new(StatusTracker::new(config.status_path()));
    status.write_initial().await;

    let manager = SandboxManager::new(config.manager_config(), backends(&config, &status));
    info!(
        workspace_root = %config.workspace_root.display(),
        max_per_user = config.sandbox.max_per_user,
        "sandbox manager ready"
    );

    Ok(Runtime {
        config,
        status,
        manager,
        _lock: lock,
    })
}

fn backends(config: &RunnerConfig, status: &Arc<StatusTracker>) -> Backends {
    let mut backends = Backends::host(config.tmux.binary.clone());
    backends.metrics = Arc::clone(status) as _;
    if let Some(preview) = &config.preview {
        backends.preview = Arc::new(CommandPreviewServer::new(preview.command.clone()));
    }
    backends.test_policy = config.test.policy();
    backends
}
