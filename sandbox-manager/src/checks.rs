use std::fs;
use std::path::{Path, PathBuf};

use sandbox::{ProcessExit, Result, SandboxError};
use serde::Serialize;
use tracing::warn;

/// How `test_sandbox` decides what to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    /// File whose presence marks a project with its own test command.
    pub manifest: String,
    /// Shell command run when the manifest is present.
    pub command: String,
    /// Program and leading arguments of the per-file syntax check; the file
    /// path is appended.
    pub syntax_check: Vec<String>,
    /// Extension (without the dot) of files the syntax check covers.
    pub script_extension: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            manifest: "package.json".to_string(),
            command: "npm test".to_string(),
            syntax_check: vec!["node".to_string(), "--check".to_string()],
            script_extension: "js".to_string(),
        }
    }
}

/// Decides whether a project test run passed.
pub trait TestPolicy: Send + Sync {
    fn passed(&self, exit: &ProcessExit) -> bool;
}

/// Passes unless the combined output mentions the failure marker,
/// case-insensitively. The exit status is ignored.
#[derive(Debug, Clone)]
pub struct FailureMarkerPolicy {
    marker: String,
}

impl FailureMarkerPolicy {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into().to_lowercase(),
        }
    }
}

impl Default for FailureMarkerPolicy {
    fn default() -> Self {
        Self::new("failed")
    }
}

impl TestPolicy for FailureMarkerPolicy {
    fn passed(&self, exit: &ProcessExit) -> bool {
        !exit
            .combined_output()
            .to_lowercase()
            .contains(&self.marker)
    }
}

/// Passes iff the test command exited with status 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitStatusPolicy;

impl TestPolicy for ExitStatusPolicy {
    fn passed(&self, exit: &ProcessExit) -> bool {
        exit.success()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// The project's own test command ran.
    Project,
    /// Each script file was syntax-checked.
    SyntaxCheck,
    /// Nothing to run.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub passed: bool,
    pub kind: TestKind,
    pub output: String,
}

impl TestReport {
    pub(crate) fn empty() -> Self {
        Self {
            passed: true,
            kind: TestKind::Empty,
            output: "no tests found".to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TestPlan {
    Project,
    SyntaxCheck(Vec<PathBuf>),
    Empty,
}

/// Inspect `dir` and pick what to run.
pub(crate) async fn plan(dir: &Path, config: &TestConfig) -> Result<TestPlan> {
    if tokio::fs::try_exists(dir.join(&config.manifest)).await? {
        return Ok(TestPlan::Project);
    }
    let root = dir.to_path_buf();
    let extension = config.script_extension.clone();
    let files = tokio::task::spawn_blocking(move || script_files(&root, &extension))
        .await
        .map_err(|e| SandboxError::Execution(format!("scan for scripts: {e}")))?;
    if files.is_empty() {
        Ok(TestPlan::Empty)
    } else {
        Ok(TestPlan::SyntaxCheck(files))
    }
}

/// Split the syntax check command into program and leading arguments.
pub(crate) fn syntax_checker(config: &TestConfig) -> Result<(&str, &[String])> {
    match config.syntax_check.split_first() {
        Some((program, args)) => Ok((program.as_str(), args)),
        None => Err(SandboxError::InvalidConfig(
            "syntax check command is empty".into(),
        )),
    }
}

/// Files under `root` with the given extension, sorted, skipping
/// dependency and VCS directories. Unreadable directories are skipped.
fn script_files(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                let ignored = sandbox_host::IGNORED_DIRS
                    .iter()
                    .any(|name| entry.file_name() == *name);
                if !ignored {
                    pending.push(path);
                }
            } else if file_type.is_file()
                && path.extension().is_some_and(|ext| ext == extension)
            {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(code: i32, stdout: &str) -> ProcessExit {
        ProcessExit {
            pid: 1,
            exit_code: Some(code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn failure_marker_is_case_insensitive() {
        let policy = FailureMarkerPolicy::default();
        assert!(policy.passed(&exit(0, "3 passing")));
        assert!(!policy.passed(&exit(0, "1 test FAILED")));
        // Exit status does not matter to this policy.
        assert!(policy.passed(&exit(1, "")));
    }

    #[test]
    fn exit_status_policy_uses_exit_code() {
        assert!(ExitStatusPolicy.passed(&exit(0, "1 failed")));
        assert!(!ExitStatusPolicy.passed(&exit(2, "")));
    }

    #[tokio::test]
    async fn manifest_selects_project_tests() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        let plan = plan(dir.path(), &TestConfig::default()).await.unwrap();
        assert_eq!(plan, TestPlan::Project);
    }

    #[tokio::test]
    async fn scripts_are_found_recursively_outside_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/lib")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::write(dir.path().join("app.js"), "").unwrap();
        fs::write(dir.path().join("src/lib/util.js"), "").unwrap();
        fs::write(dir.path().join("src/readme.md"), "").unwrap();
        fs::write(dir.path().join("node_modules/dep/index.js"), "").unwrap();

        let plan = plan(dir.path(), &TestConfig::default()).await.unwrap();
        assert_eq!(
            plan,
            TestPlan::SyntaxCheck(vec![
                dir.path().join("app.js"),
                dir.path().join("src/lib/util.js"),
            ])
        );
    }

    #[tokio::test]
    async fn nothing_to_test() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        let plan = plan(dir.path(), &TestConfig::default()).await.unwrap();
        assert_eq!(plan, TestPlan::Empty);
    }

    #[test]
    fn empty_syntax_checker_is_rejected() {
        let config = TestConfig {
            syntax_check: Vec::new(),
            ..TestConfig::default()
        };
        assert!(matches!(
            syntax_checker(&config),
            Err(SandboxError::InvalidConfig(_))
        ));
        let default_config = TestConfig::default();
        let (program, args) = syntax_checker(&default_config).unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, ["--check".to_string()]);
    }
}
