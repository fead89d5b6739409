use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct CleanupArgs {
    /// Path to runner.yaml
    #[arg(short, long, env = "RUNNER_CONFIG")]
    config: PathBuf,
}

/// Remove terminal sessions and stale sandbox directories left behind by a
/// previous runner. Prints the report as JSON.
pub async fn run_cleanup(args: CleanupArgs) -> RunnerResult<()> {
    let runtime = super::prepare(&args.config).await?;
    let report = runtime.manager.cleanup_orphans().await;
    info!(
        sessions = report.sessions.len(),
        directories = report.directories.len(),
        "cleanup complete"
    );
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| RunnerError::Internal(format!("serialize report: {e}")))?;
    println!("{json}");
    Ok(())
}
