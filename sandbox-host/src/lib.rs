mod command;
mod disk;
mod paths;
mod prerequisites;
mod preview;
mod process;
mod throttle;
mod tmux;
mod workspace;

pub use command::{CommandError, exec};
pub use disk::DuDiskUsage;
pub use paths::{WorkspacePaths, backup_path};
pub use prerequisites::{check_prerequisites, missing_optional_commands};
pub use preview::CommandPreviewServer;
pub use process::{PsStatsProvider, force_kill, is_alive, kill_process_group, terminate};
pub use throttle::CpulimitThrottle;
pub use tmux::TmuxMultiplexer;
pub use workspace::{IGNORED_DIRS, SandboxDir, WorkspaceStore};
