use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use sandbox::{PreviewServer, SandboxError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::process::kill_process_group;

/// Preview server launched by running a shell command (e.g. `npm run dev`)
/// inside the sandbox directory.
pub struct CommandPreviewServer {
    command: String,
    running: Mutex<HashMap<String, tokio::process::Child>>,
}

impl CommandPreviewServer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            running: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

/// Forward the server's output to the log until its pipes close.
fn forward_output(sandbox_id: &str, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        let id = sandbox_id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(id = %id, "preview: {line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let id = sandbox_id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(id = %id, "preview stderr: {line}");
                }
            }
        });
    }
}

#[async_trait]
impl PreviewServer for CommandPreviewServer {
    async fn start_preview(&self, sandbox_id: &str, path: &Path) -> sandbox::Result<()> {
        let mut running = self.running.lock().await;
        if running.contains_key(sandbox_id) {
            return Ok(());
        }

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", &self.command])
            .current_dir(path)
            .process_group(0)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Execution(format!("spawn preview server: {e}")))?;

        forward_output(sandbox_id, &mut child);
        info!(id = %sandbox_id, pid = ?child.id(), command = %self.command, "preview server started");
        running.insert(sandbox_id.to_owned(), child);
        Ok(())
    }

    async fn stop_preview(&self, sandbox_id: &str) {
        let Some(mut child) = self.running.lock().await.remove(sandbox_id) else {
            return;
        };
        kill_process_group(&child);
        let _ = child.wait().await;
        info!(id = %sandbox_id, "preview server stopped");
    }
}
