mod cmd;
mod config;
mod error;
mod lock;
mod paths;
mod protocol;
mod status;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify host prerequisites (tmux, ps, du, cpulimit)
    Check(cmd::CheckArgs),
    /// Kill orphaned terminal sessions and remove stale sandbox directories
    Cleanup(cmd::CleanupArgs),
    /// Run one program in a fresh sandbox, then test, promote or discard it
    Run(Box<cmd::RunArgs>),
    /// Serve sandbox requests as JSON lines on stdin/stdout
    Serve(cmd::ServeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries protocol output in `serve`, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Check(args) => cmd::run_check(args).await.map(|()| ExitCode::SUCCESS),
        Command::Cleanup(args) => cmd::run_cleanup(args).await.map(|()| ExitCode::SUCCESS),
        Command::Run(args) => cmd::run_run(*args).await,
        Command::Serve(args) => cmd::run_serve(args).await.map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
