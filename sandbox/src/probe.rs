use std::path::Path;

use async_trait::async_trait;

use crate::types::ProcessStats;

/// Reads per-process CPU and memory from the OS process table.
#[async_trait]
pub trait ProcessStatsProvider: Send + Sync {
    /// `None` when the process no longer exists or cannot be read.
    async fn stats(&self, pid: u32) -> Option<ProcessStats>;
}

/// Measures directory disk usage.
#[async_trait]
pub trait DiskUsageProvider: Send + Sync {
    /// Used space in MB; 0 on any measurement failure.
    async fn usage_mb(&self, path: &Path) -> u64;
}

/// Opportunistic OS-level CPU rate limiting.
#[async_trait]
pub trait CpuThrottle: Send + Sync {
    /// Returns `false` when no limiting tool is available on the host.
    async fn throttle(&self, pid: u32, percent: u32) -> bool;
}
