use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sandbox::{LimitKind, ProcessStatsProvider, ResourceLimits, ResourceUsage};
use sandbox_host::WorkspaceStore;

/// One accounting pass over a sandbox.
#[derive(Debug)]
pub(crate) struct Sample {
    pub usage: ResourceUsage,
    /// Tracked pids that no longer exist.
    pub gone: Vec<u32>,
}

/// Sums process and disk usage for a sandbox.
pub(crate) struct Accountant {
    stats: Arc<dyn ProcessStatsProvider>,
}

impl Accountant {
    pub(crate) fn new(stats: Arc<dyn ProcessStatsProvider>) -> Self {
        Self { stats }
    }

    /// Missing processes contribute nothing. A missing directory reads as
    /// zero disk usage.
    pub(crate) async fn measure(
        &self,
        pids: &[u32],
        path: &Path,
        workspace: &WorkspaceStore,
    ) -> Sample {
        let mut usage = ResourceUsage::default();
        let mut gone = Vec::new();
        for &pid in pids {
            match self.stats.stats(pid).await {
                Some(stats) => {
                    usage.cpu_percent += stats.cpu_percent;
                    usage.memory_mb += stats.memory_mb;
                }
                None if !sandbox_host::is_alive(pid) => gone.push(pid),
                None => {}
            }
        }
        usage.disk_mb = workspace.disk_usage(path).await;
        usage.sampled_at = Some(Utc::now());
        Sample { usage, gone }
    }
}

/// Caps that `usage` is over, memory first.
pub(crate) fn exceeded(usage: &ResourceUsage, limits: &ResourceLimits) -> Vec<LimitKind> {
    let mut kinds = Vec::new();
    if usage.memory_mb > limits.memory_mb {
        kinds.push(LimitKind::Memory);
    }
    if usage.disk_mb > limits.disk_mb {
        kinds.push(LimitKind::Disk);
    }
    kinds
}
