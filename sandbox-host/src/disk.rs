use std::path::Path;

use async_trait::async_trait;
use sandbox::DiskUsageProvider;
use tracing::debug;

use crate::command::exec;

/// Disk usage measured with `du -sk`.
pub struct DuDiskUsage;

/// Parse `du -sk` output (`<KiB>\t<path>`) into whole MB.
fn parse_du_output(output: &str) -> Option<u64> {
    let kb = output.split_whitespace().next()?.parse::<u64>().ok()?;
    Some(kb / 1024)
}

#[async_trait]
impl DiskUsageProvider for DuDiskUsage {
    async fn usage_mb(&self, path: &Path) -> u64 {
        let path_str = path.to_string_lossy();
        match exec("du", &["-sk", &path_str]).await {
            Ok(output) => parse_du_output(&output).unwrap_or(0),
            Err(e) => {
                debug!(path = %path_str, error = %e, "disk usage unavailable");
                0
            }
        }
    }
}
