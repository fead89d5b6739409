use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use sandbox::{SandboxError, SandboxEvent};
use sandbox_manager::{ProcessHandle, SandboxManager};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::protocol::{self, Output, ProcessExited, Request, Response};
use crate::status::RunnerMode;

/// Upper bound on flushing queued output after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct ServeArgs {
    /// Path to runner.yaml
    #[arg(short, long, env = "RUNNER_CONFIG")]
    config: PathBuf,
}

/// Serve the manager over stdin/stdout until EOF or a termination signal,
/// then destroy every sandbox.
pub async fn run_serve(args: ServeArgs) -> RunnerResult<()> {
    let runtime = super::prepare(&args.config).await?;
    let manager = Arc::clone(&runtime.manager);

    let report = manager.start().await;
    info!(
        sessions = report.sessions.len(),
        directories = report.directories.len(),
        status_file = %runtime.config.status_path().display(),
        "serving on stdio"
    );

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(out_rx));
    let events = tokio::spawn(forward_events(manager.subscribe(), out_tx.clone()));

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = stop_tx.send(true);
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut requests = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let manager = Arc::clone(&manager);
                    let out = out_tx.clone();
                    requests.spawn(async move {
                        let response = dispatch(&manager, &line, &out).await;
                        let _ = out.send(Output::Response(response));
                    });
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read request");
                    break;
                }
            },
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "request task failed");
                }
            }
        }
    }

    info!("shutting down");
    runtime.status.set_mode(RunnerMode::Draining).await;
    manager.shutdown().await;
    // Teardown has killed every tracked process, so in-flight requests finish.
    while let Some(joined) = requests.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "request task failed");
        }
    }

    events.abort();
    drop(out_tx);
    if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("output writer did not finish");
    }
    runtime.status.set_mode(RunnerMode::Stopped).await;
    Ok(())
}

async fn dispatch(
    manager: &Arc<SandboxManager>,
    line: &str,
    out: &mpsc::UnboundedSender<Output>,
) -> Response {
    let (seq, request) = protocol::parse(line);
    let outcome = match request {
        Ok(request) => handle(manager, request, out).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &outcome {
        debug!(?seq, kind = e.kind(), error = %e, "request failed");
    }
    Response::new(seq, outcome)
}

async fn handle(
    manager: &Arc<SandboxManager>,
    request: Request,
    out: &mpsc::UnboundedSender<Output>,
) -> RunnerResult<Value> {
    match request {
        Request::Create { sandbox } => to_value(&manager.create_sandbox(sandbox).await?),
        Request::Run { id, command } => {
            manager.run_in_sandbox(&id, &command).await?;
            Ok(Value::Null)
        }
        Request::Exec { id, program, args } => {
            let handle = manager.execute_in_sandbox(&id, &program, &args).await?;
            let pid = handle.pid();
            tokio::spawn(report_exit(id, handle, out.clone()));
            Ok(serde_json::json!({ "pid": pid }))
        }
        Request::Test { id } => to_value(&manager.test_sandbox(&id).await?),
        Request::Promote { id, target } => {
            let path = manager.promote_sandbox(&id, target.as_deref()).await?;
            Ok(serde_json::json!({ "path": path }))
        }
        Request::Destroy { id } => {
            manager.destroy_sandbox(&id).await;
            Ok(Value::Null)
        }
        Request::Get { id } => match manager.get(&id).await {
            Some(session) => to_value(&session),
            None => Err(SandboxError::NotFound(id).into()),
        },
        Request::List { user_id } => to_value(&manager.list(user_id.as_deref()).await),
        Request::Stats => to_value(&manager.stats().await),
    }
}

fn to_value<T: Serialize>(value: &T) -> RunnerResult<Value> {
    serde_json::to_value(value).map_err(|e| RunnerError::Internal(format!("serialize: {e}")))
}

/// Wait for an `exec`'d process and publish its output.
async fn report_exit(sandbox_id: String, handle: ProcessHandle, out: mpsc::UnboundedSender<Output>) {
    match handle.wait_with_output().await {
        Ok(exit) => {
            let _ = out.send(Output::Exited(ProcessExited {
                event: ProcessExited::EVENT,
                sandbox_id,
                pid: exit.pid,
                exit_code: exit.exit_code,
                stdout: String::from_utf8_lossy(&exit.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&exit.stderr).into_owned(),
            }));
        }
        Err(e) => warn!(sandbox_id, error = %e, "lost track of process"),
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<SandboxEvent>,
    out: mpsc::UnboundedSender<Output>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if out.send(Output::Event(event)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Single writer for stdout so lines never interleave.
async fn write_lines(mut rx: mpsc::UnboundedReceiver<Output>) {
    let mut stdout = tokio::io::stdout();
    while let Some(output) = rx.recv().await {
        let mut line = match serde_json::to_vec(&output) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize output");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            warn!(error = %e, "stdout closed");
            break;
        }
        if let Err(e) = stdout.flush().await {
            warn!(error = %e, "stdout closed");
            break;
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT"),
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
