use std::path::Path;

use sandbox::SandboxError;
use tracing::warn;

/// Tools used opportunistically; their absence only degrades accounting
/// or CPU limiting.
const OPTIONAL_COMMANDS: &[&str] = &["cpulimit", "du", "ps"];

/// Verify that the host can run sandboxes.
///
/// The multiplexer binary is required; all failures are collected into a
/// single `BackendNotAvailable` error. Missing optional tools are logged.
pub fn check_prerequisites(tmux_binary: &Path) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    if which::which(tmux_binary).is_err() {
        errors.push(format!(
            "required command not found: {}",
            tmux_binary.display()
        ));
    }
    if which::which("sh").is_err() {
        errors.push("required command not found: sh".to_string());
    }

    for missing in missing_optional_commands() {
        warn!(command = missing, "optional command not found");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

/// Optional host tools that are not on `PATH`.
pub fn missing_optional_commands() -> Vec<&'static str> {
    OPTIONAL_COMMANDS
        .iter()
        .copied()
        .filter(|cmd| which::which(cmd).is_err())
        .collect()
}
