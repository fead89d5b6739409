use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// A terminal multiplexer holding one persistent, named shell per sandbox.
#[async_trait]
pub trait TerminalMultiplexer: Send + Sync {
    /// Human-readable name for this backend (e.g. "tmux").
    fn name(&self) -> &str;
    /// Start a detached session rooted at `working_dir`.
    /// A session that already exists under `session` is an error.
    async fn create(&self, session: &str, working_dir: &Path) -> Result<()>;
    /// Type `command` into the session, prefixed by a `cd` to `working_dir`.
    /// Output is not captured.
    async fn send_command(&self, session: &str, working_dir: &Path, command: &str) -> Result<()>;
    /// Terminate the session. A session that is already gone is not an error.
    async fn kill(&self, session: &str) -> Result<()>;
    /// Names of live sessions starting with `prefix`.
    async fn list_sessions(&self, prefix: &str) -> Result<Vec<String>>;
    /// Pid of the shell running in the session, if the backend exposes it.
    async fn shell_pid(&self, session: &str) -> Result<Option<u32>>;
}
