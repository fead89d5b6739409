use std::path::PathBuf;

use clap::Args;
use tracing::{info, warn};

use crate::config;
use crate::error::RunnerResult;

#[derive(Args)]
pub struct CheckArgs {
    /// Runner config; only its tmux binary is used
    #[arg(short, long, env = "RUNNER_CONFIG")]
    config: Option<PathBuf>,
}

pub async fn run_check(args: CheckArgs) -> RunnerResult<()> {
    let tmux = match &args.config {
        Some(path) => config::load(path).await?.tmux.binary,
        None => PathBuf::from("tmux"),
    };

    sandbox_host::check_prerequisites(&tmux)?;

    let missing = sandbox_host::missing_optional_commands();
    if missing.is_empty() {
        info!("all prerequisites present");
    } else {
        warn!(
            missing = %missing.join(", "),
            "required tools present; resource accounting or CPU limiting is degraded"
        );
    }
    Ok(())
}
