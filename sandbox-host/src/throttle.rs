use std::path::PathBuf;

use async_trait::async_trait;
use sandbox::CpuThrottle;
use tracing::{info, warn};

/// CPU limiting through the `cpulimit` tool, when it is installed.
pub struct CpulimitThrottle {
    binary: Option<PathBuf>,
}

impl Default for CpulimitThrottle {
    fn default() -> Self {
        Self::detect()
    }
}

impl CpulimitThrottle {
    /// Locate `cpulimit` on `PATH`.
    pub fn detect() -> Self {
        let binary = which::which("cpulimit").ok();
        if binary.is_none() {
            warn!("cpulimit not found, CPU limits will not be applied");
        }
        Self { binary }
    }

    pub fn is_available(&self) -> bool {
        self.binary.is_some()
    }
}

#[async_trait]
impl CpuThrottle for CpulimitThrottle {
    async fn throttle(&self, pid: u32, percent: u32) -> bool {
        let Some(binary) = &self.binary else {
            return false;
        };

        // `-z` makes cpulimit exit on its own once the target is gone.
        let spawned = tokio::process::Command::new(binary)
            .args(["-z", "-l", &percent.to_string(), "-p", &pid.to_string()])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                info!(pid, percent, "cpu limit applied");
                true
            }
            Err(e) => {
                warn!(pid, error = %e, "failed to start cpulimit");
                false
            }
        }
    }
}
