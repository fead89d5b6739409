use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox::{SandboxError, TerminalMultiplexer};
use tracing::{debug, info};

use crate::command::{CommandError, exec};

/// stderr fragments tmux prints when the target session or server is gone.
const GONE_MARKERS: &[&str] = &[
    "can't find session",
    "no server running",
    "session not found",
    "error connecting to",
];

/// `tmux`-backed terminal multiplexer.
pub struct TmuxMultiplexer {
    binary: PathBuf,
}

impl Default for TmuxMultiplexer {
    fn default() -> Self {
        Self::new(PathBuf::from("tmux"))
    }
}

impl TmuxMultiplexer {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn tmux(&self, args: &[&str]) -> Result<String, CommandError> {
        exec(&self.binary.to_string_lossy(), args).await
    }
}

/// Exact-match session target; without `=` tmux falls back to prefix matching.
fn session_target(session: &str) -> String {
    format!("={session}")
}

/// Pane target for the active pane of `session`.
fn pane_target(session: &str) -> String {
    format!("={session}:")
}

fn is_gone(err: &CommandError) -> bool {
    GONE_MARKERS.iter().any(|m| err.detail.contains(m))
}

/// Quote `s` for POSIX sh inside single quotes.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The line typed into the session: always re-rooted at the sandbox.
fn rooted_command(working_dir: &Path, command: &str) -> String {
    format!(
        "cd {} && {command}",
        shell_quote(&working_dir.to_string_lossy())
    )
}

/// Parse `list-sessions -F '#{session_name}'` output, keeping names with `prefix`.
fn parse_session_names(output: &str, prefix: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && name.starts_with(prefix))
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl TerminalMultiplexer for TmuxMultiplexer {
    fn name(&self) -> &str {
        "tmux"
    }

    async fn create(&self, session: &str, working_dir: &Path) -> sandbox::Result<()> {
        let dir = working_dir.to_string_lossy();
        self.tmux(&["new-session", "-d", "-s", session, "-c", &dir])
            .await
            .map_err(|e| SandboxError::Terminal(format!("create session {session}: {e}")))?;
        info!(session, dir = %dir, "tmux session created");
        Ok(())
    }

    async fn send_command(
        &self,
        session: &str,
        working_dir: &Path,
        command: &str,
    ) -> sandbox::Result<()> {
        let line = rooted_command(working_dir, command);
        let target = pane_target(session);
        // `-l` sends the line literally so words like "Enter" inside it are not
        // interpreted as key names.
        self.tmux(&["send-keys", "-t", &target, "-l", &line])
            .await
            .map_err(|e| SandboxError::Terminal(format!("send to {session}: {e}")))?;
        self.tmux(&["send-keys", "-t", &target, "Enter"])
            .await
            .map_err(|e| SandboxError::Terminal(format!("send to {session}: {e}")))?;
        debug!(session, command, "command sent");
        Ok(())
    }

    async fn kill(&self, session: &str) -> sandbox::Result<()> {
        match self
            .tmux(&["kill-session", "-t", &session_target(session)])
            .await
        {
            Ok(_) => {
                info!(session, "tmux session killed");
                Ok(())
            }
            Err(e) if is_gone(&e) => {
                debug!(session, "tmux session already gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::Terminal(format!("kill {session}: {e}"))),
        }
    }

    async fn list_sessions(&self, prefix: &str) -> sandbox::Result<Vec<String>> {
        match self.tmux(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(output) => Ok(parse_session_names(&output, prefix)),
            Err(e) if is_gone(&e) => Ok(Vec::new()),
            Err(e) => Err(SandboxError::Terminal(format!("list sessions: {e}"))),
        }
    }

    async fn shell_pid(&self, session: &str) -> sandbox::Result<Option<u32>> {
        match self
            .tmux(&["display-message", "-p", "-t", &pane_target(session), "#{pane_pid}"])
            .await
        {
            Ok(output) => Ok(output.trim().parse().ok()),
            Err(e) if is_gone(&e) => Ok(None),
            Err(e) => Err(SandboxError::Terminal(format!("pane pid {session}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn rooted_command_changes_directory_first() {
        let line = rooted_command(Path::new("/ws/u1/sandboxes/sbx-1"), "npm install");
        assert_eq!(line, "cd '/ws/u1/sandboxes/sbx-1' && npm install");
    }

    #[test]
    fn targets_are_exact_match() {
        assert_eq!(session_target("sandbox_a"), "=sandbox_a");
        assert_eq!(pane_target("sandbox_a"), "=sandbox_a:");
    }

    #[test]
    fn parse_session_names_filters_prefix() {
        let output = "sandbox_one\nmain\n\nsandbox_two\n";
        assert_eq!(
            parse_session_names(output, "sandbox_"),
            vec!["sandbox_one".to_string(), "sandbox_two".to_string()]
        );
    }

    #[test]
    fn gone_errors_are_recognized() {
        let err = CommandError {
            command: "tmux kill-session -t =x".into(),
            detail: "can't find session: x".into(),
        };
        assert!(is_gone(&err));
        let err = CommandError {
            command: "tmux new-session".into(),
            detail: "duplicate session: x".into(),
        };
        assert!(!is_gone(&err));
    }
}
