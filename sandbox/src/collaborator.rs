use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Per-sandbox metrics collection. Fire-and-forget.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn start_collecting(&self, sandbox_id: &str, path: &Path);
    async fn stop_collecting(&self, sandbox_id: &str);
}

/// Starts a development preview server for a sandbox.
#[async_trait]
pub trait PreviewServer: Send + Sync {
    async fn start_preview(&self, sandbox_id: &str, path: &Path) -> Result<()>;
    async fn stop_preview(&self, sandbox_id: &str);
}

/// Collaborator that does nothing; used when no metrics or preview backend
/// is configured.
pub struct Detached;

#[async_trait]
impl MetricsCollector for Detached {
    async fn start_collecting(&self, _sandbox_id: &str, _path: &Path) {}
    async fn stop_collecting(&self, _sandbox_id: &str) {}
}

#[async_trait]
impl PreviewServer for Detached {
    async fn start_preview(&self, _sandbox_id: &str, _path: &Path) -> Result<()> {
        Ok(())
    }
    async fn stop_preview(&self, _sandbox_id: &str) {}
}
