use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use sandbox::SandboxConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

use crate::error::RunnerResult;
use crate::status::RunnerMode;

#[derive(Args)]
pub struct RunArgs {
    /// Path to runner.yaml
    #[arg(short, long, env = "RUNNER_CONFIG")]
    config: PathBuf,
    /// Owner of the sandbox
    #[arg(long)]
    user: String,
    /// Project the sandbox belongs to (and is promoted to)
    #[arg(long)]
    project: String,
    /// Seed the sandbox from this project of the same user
    #[arg(long)]
    base_from: Option<String>,
    /// Time-to-live in seconds
    #[arg(long)]
    time_limit: Option<u64>,
    /// Run the project's tests after the program exits
    #[arg(long)]
    test: bool,
    /// Promote the sandbox to the project directory on success
    #[arg(long)]
    promote: bool,
    /// Program and arguments to run inside the sandbox
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

/// Create a sandbox, run one program in it, optionally test and promote,
/// and tear it down. The exit code is the program's, or 1 when tests fail.
pub async fn run_run(args: RunArgs) -> RunnerResult<ExitCode> {
    let runtime = super::prepare(&args.config).await?;
    let manager = &runtime.manager;
    manager.start_sampler().await;

    let mut request = SandboxConfig::new(args.user, args.project);
    request.base_from = args.base_from;
    request.time_limit = args.time_limit;
    let session = manager.create_sandbox(request).await?;
    let id = session.id.as_str();

    let outcome = run_steps(&runtime, id, &args.command, args.test, args.promote).await;
    if !matches!(outcome, Ok(Finish::Promoted)) {
        manager.destroy_sandbox(id).await;
    }
    manager.shutdown().await;
    runtime.status.set_mode(RunnerMode::Stopped).await;

    match outcome? {
        Finish::Promoted => Ok(ExitCode::SUCCESS),
        Finish::Discarded(code) => Ok(code),
    }
}

enum Finish {
    Promoted,
    Discarded(ExitCode),
}

async fn run_steps(
    runtime: &super::Runtime,
    id: &str,
    command: &[String],
    test: bool,
    promote: bool,
) -> RunnerResult<Finish> {
    let manager = &runtime.manager;
    let (program, args) = match command.split_first() {
        Some((program, args)) => (program.as_str(), args),
        None => return Ok(Finish::Discarded(ExitCode::FAILURE)),
    };

    let mut handle = manager.execute_in_sandbox(id, program, args).await?;
    let pid = handle.pid();
    info!(sandbox_id = id, pid, program, "program started");
    let stdout = handle.stdout.take().map(|s| tokio::spawn(log_lines(s, pid, false)));
    let stderr = handle.stderr.take().map(|s| tokio::spawn(log_lines(s, pid, true)));
    let code = handle.wait().await?;
    for task in [stdout, stderr].into_iter().flatten() {
        let _ = task.await;
    }
    info!(sandbox_id = id, pid, ?code, "program exited");

    if code != Some(0) {
        let status = code.and_then(|c| u8::try_from(c).ok()).unwrap_or(1);
        return Ok(Finish::Discarded(ExitCode::from(status)));
    }

    if test {
        let report = manager.test_sandbox(id).await?;
        info!(sandbox_id = id, passed = report.passed, kind = ?report.kind, "tests finished");
        for line in report.output.lines().filter(|l| !l.is_empty()) {
            info!(sandbox_id = id, "test: {line}");
        }
        if !report.passed {
            return Ok(Finish::Discarded(ExitCode::FAILURE));
        }
    }

    if promote {
        let path = manager.promote_sandbox(id, None).await?;
        info!(
            sandbox_id = id,
            path = %path.display(),
            workspace = %runtime.config.workspace_root.display(),
            "sandbox promoted"
        );
        return Ok(Finish::Promoted);
    }

    // Success without promotion still discards the sandbox.
    Ok(Finish::Discarded(ExitCode::SUCCESS))
}

/// Forward a program's output to the log, one event per line.
async fn log_lines<R: AsyncRead + Unpin>(reader: R, pid: u32, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.is_empty() => {}
            Ok(Some(line)) if is_stderr => warn!(pid, "stderr: {line}"),
            Ok(Some(line)) => info!(pid, "stdout: {line}"),
            Ok(None) => break,
            Err(e) => {
                warn!(pid, error = %e, "output stream error");
                break;
            }
        }
    }
}
