//! Lifecycle management for per-user sandboxes: isolated working
//! directories with a persistent terminal session, tracked processes,
//! resource accounting and automatic expiry.

mod accounting;
mod checks;
mod config;
mod id;
mod manager;
mod registry;
mod stats;
mod tracked;

pub use checks::{ExitStatusPolicy, FailureMarkerPolicy, TestConfig, TestKind, TestPolicy, TestReport};
pub use config::{
    DEFAULT_KILL_GRACE, DEFAULT_MAX_PER_USER, DEFAULT_ORPHAN_MAX_AGE, DEFAULT_SAMPLE_INTERVAL,
    DEFAULT_SESSION_PREFIX, ManagerConfig,
};
pub use manager::{Backends, OrphanReport, SandboxManager};
pub use stats::{ManagerStats, SessionStats};
pub use tracked::ProcessHandle;
