mod collaborator;
mod config;
mod error;
mod events;
mod probe;
mod terminal;
mod types;

pub use collaborator::{Detached, MetricsCollector, PreviewServer};
pub use config::{ResourceLimits, SandboxConfig};
pub use error::{Result, SandboxError};
pub use events::SandboxEvent;
pub use probe::{CpuThrottle, DiskUsageProvider, ProcessStatsProvider};
pub use terminal::TerminalMultiplexer;
pub use types::{
    LimitKind, ProcessExit, ProcessStats, ResourceUsage, SandboxSession, SandboxStatus,
};
