use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sandbox::ResourceLimits;
use sandbox_manager::{
    DEFAULT_KILL_GRACE, DEFAULT_MAX_PER_USER, DEFAULT_ORPHAN_MAX_AGE, DEFAULT_SAMPLE_INTERVAL,
    DEFAULT_SESSION_PREFIX, ExitStatusPolicy, FailureMarkerPolicy, ManagerConfig, TestConfig,
    TestPolicy,
};
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};
use crate::paths::RunnerPaths;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub workspace_root: PathBuf,
    /// Defaults to `<workspace_root>/status.json`.
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    #[serde(default)]
    pub sandbox: SandboxDefaults,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub test: TestSuiteConfig,
    #[serde(default)]
    pub preview: Option<PreviewConfig>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxDefaults {
    pub max_per_user: usize,
    pub cpu_percent: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub time_limit_secs: u64,
    pub sample_interval_secs: u64,
    pub kill_grace_secs: u64,
    pub orphan_max_age_secs: u64,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            max_per_user: DEFAULT_MAX_PER_USER,
            cpu_percent: limits.cpu_percent,
            memory_mb: limits.memory_mb,
            disk_mb: limits.disk_mb,
            time_limit_secs: limits.time_limit_secs,
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL.as_secs(),
            kill_grace_secs: DEFAULT_KILL_GRACE.as_secs(),
            orphan_max_age_secs: DEFAULT_ORPHAN_MAX_AGE.as_secs(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    /// Bare names are looked up on `PATH`.
    pub binary: PathBuf,
    pub session_prefix: String,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tmux"),
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Fail when the output contains `failure_marker`.
    FailureMarker,
    /// Fail on a non-zero exit status.
    ExitStatus,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSuiteConfig {
    pub manifest: String,
    pub command: String,
    pub verdict: Verdict,
    pub failure_marker: String,
    pub syntax_check: Vec<String>,
    pub script_extension: String,
}

impl Default for TestSuiteConfig {
    fn default() -> Self {
        let defaults = TestConfig::default();
        Self {
            manifest: defaults.manifest,
            command: defaults.command,
            verdict: Verdict::FailureMarker,
            failure_marker: "failed".to_string(),
            syntax_check: defaults.syntax_check,
            script_extension: defaults.script_extension,
        }
    }
}

impl TestSuiteConfig {
    pub fn policy(&self) -> Arc<dyn TestPolicy> {
        match self.verdict {
            Verdict::FailureMarker => Arc::new(FailureMarkerPolicy::new(&self.failure_marker)),
            Verdict::ExitStatus => Arc::new(ExitStatusPolicy),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Shell command started in each new sandbox, e.g. `npm run dev`.
    pub command: String,
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl RunnerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.workspace_root);
        if let Some(status) = &mut self.status_file {
            resolve(status);
        }
        // A bare command name stays a PATH lookup.
        if self.tmux.binary.components().count() > 1 {
            resolve(&mut self.tmux.binary);
        }
    }

    fn validate(&self) -> RunnerResult<()> {
        if self.sandbox.max_per_user == 0 {
            return Err(RunnerError::Config("sandbox.max_per_user must be at least 1".into()));
        }
        if self.sandbox.time_limit_secs == 0 {
            return Err(RunnerError::Config("sandbox.time_limit_secs must be at least 1".into()));
        }
        if self.sandbox.sample_interval_secs == 0 {
            return Err(RunnerError::Config(
                "sandbox.sample_interval_secs must be at least 1".into(),
            ));
        }
        if self.test.syntax_check.is_empty() {
            return Err(RunnerError::Config("test.syntax_check must name a program".into()));
        }
        if self.tmux.session_prefix.is_empty() {
            return Err(RunnerError::Config("tmux.session_prefix must not be empty".into()));
        }
        Ok(())
    }

    pub fn paths(&self) -> RunnerPaths {
        RunnerPaths::new(self.workspace_root.clone())
    }

    pub fn status_path(&self) -> PathBuf {
        self.status_file
            .clone()
            .unwrap_or_else(|| self.paths().status())
    }

    /// Build the manager settings from this runner config.
    pub fn manager_config(&self) -> ManagerConfig {
        let s = &self.sandbox;
        ManagerConfig {
            workspace_root: self.workspace_root.clone(),
            max_per_user: s.max_per_user,
            defaults: ResourceLimits {
                cpu_percent: s.cpu_percent,
                memory_mb: s.memory_mb,
                disk_mb: s.disk_mb,
                time_limit_secs: s.time_limit_secs,
            },
            sample_interval: Duration::from_secs(s.sample_interval_secs),
            kill_grace: Duration::from_secs(s.kill_grace_secs),
            orphan_max_age: Duration::from_secs(s.orphan_max_age_secs),
            session_prefix: self.tmux.session_prefix.clone(),
            test: TestConfig {
                manifest: self.test.manifest.clone(),
                command: self.test.command.clone(),
                syntax_check: self.test.syntax_check.clone(),
                script_extension: self.test.script_extension.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use sandbox::ProcessExit;

    use super::*;

    async fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let config_path = dir.join("runner.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();
        config_path
    }

    fn exit(code: i32, stdout: &str) -> ProcessExit {
        ProcessExit {
            pid: 1,
            exit_code: Some(code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
workspace_root: {root}
status_file: {root}/state/status.json
sandbox:
  max_per_user: 3
  cpu_percent: 25
  memory_mb: 1024
  disk_mb: 2048
  time_limit_secs: 600
  sample_interval_secs: 10
  kill_grace_secs: 2
  orphan_max_age_secs: 3600
tmux:
  binary: /usr/local/bin/tmux
  session_prefix: "ws_"
test:
  manifest: Cargo.toml
  command: "cargo test"
  verdict: exit_status
  failure_marker: FAIL
  syntax_check: ["python3", "-m", "py_compile"]
  script_extension: py
preview:
  command: "npm run dev"
"#,
            root = dir.path().display(),
        );
        let config = load(&write_config(dir.path(), &yaml).await).await.unwrap();

        assert_eq!(config.workspace_root, dir.path());
        assert_eq!(config.status_path(), dir.path().join("state/status.json"));
        assert_eq!(config.tmux.binary, PathBuf::from("/usr/local/bin/tmux"));
        assert_eq!(config.test.verdict, Verdict::ExitStatus);
        assert_eq!(
            config.preview.as_ref().map(|p| p.command.as_str()),
            Some("npm run dev")
        );

        let manager = config.manager_config();
        assert_eq!(manager.max_per_user, 3);
        assert_eq!(manager.defaults.cpu_percent, 25);
        assert_eq!(manager.defaults.memory_mb, 1024);
        assert_eq!(manager.defaults.disk_mb, 2048);
        assert_eq!(manager.defaults.time_limit_secs, 600);
        assert_eq!(manager.sample_interval, Duration::from_secs(10));
        assert_eq!(manager.kill_grace, Duration::from_secs(2));
        assert_eq!(manager.orphan_max_age, Duration::from_secs(3600));
        assert_eq!(manager.session_prefix, "ws_");
        assert_eq!(manager.test.manifest, "Cargo.toml");
        assert_eq!(manager.test.script_extension, "py");
    }

    #[tokio::test]
    async fn load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!("workspace_root: {}\n", dir.path().display());
        let config = load(&write_config(dir.path(), &yaml).await).await.unwrap();

        assert_eq!(config.sandbox, SandboxDefaults::default());
        assert_eq!(config.sandbox.max_per_user, DEFAULT_MAX_PER_USER);
        assert_eq!(config.tmux.binary, PathBuf::from("tmux"));
        assert_eq!(config.tmux.session_prefix, "sandbox_");
        assert_eq!(config.test.command, "npm test");
        assert_eq!(config.test.verdict, Verdict::FailureMarker);
        assert!(config.preview.is_none());
        assert_eq!(config.status_path(), dir.path().join("status.json"));

        let manager = config.manager_config();
        assert_eq!(manager.defaults, ResourceLimits::default());
        assert_eq!(manager.orphan_max_age, Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
workspace_root: workspaces
status_file: run/status.json
tmux:
  binary: bin/tmux
"#;
        let config = load(&write_config(dir.path(), yaml).await).await.unwrap();

        assert!(config.workspace_root.is_absolute());
        assert_eq!(config.workspace_root, dir.path().join("workspaces"));
        assert_eq!(config.status_path(), dir.path().join("run/status.json"));
        assert_eq!(config.tmux.binary, dir.path().join("bin/tmux"));
    }

    #[tokio::test]
    async fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "workspace_root: {}\nsandbox:\n  max_per_user: 0\n",
            dir.path().display()
        );
        let err = load(&write_config(dir.path(), &yaml).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max_per_user"), "got: {err}");

        let yaml = format!(
            "workspace_root: {}\ntest:\n  syntax_check: []\n",
            dir.path().display()
        );
        let err = load(&write_config(dir.path(), &yaml).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("syntax_check"), "got: {err}");
    }

    #[tokio::test]
    async fn load_fails_on_missing_file_and_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));

        let err = load(&write_config(dir.path(), "sandbox: [").await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("parse"), "got: {err}");
    }

    #[test]
    fn verdict_selects_policy() {
        let mut test = TestSuiteConfig::default();
        let policy = test.policy();
        assert!(!policy.passed(&exit(0, "2 FAILED")));
        assert!(policy.passed(&exit(1, "")));

        test.verdict = Verdict::ExitStatus;
        let policy = test.policy();
        assert!(policy.passed(&exit(0, "2 FAILED")));
        assert!(!policy.passed(&exit(1, "")));
    }

    #[test]
    fn yaml_round_trip() {
        let config = RunnerConfig {
            workspace_root: PathBuf::from("/srv/ws"),
            status_file: None,
            sandbox: SandboxDefaults::default(),
            tmux: TmuxConfig::default(),
            test: TestSuiteConfig::default(),
            preview: Some(PreviewConfig {
                command: "npm run dev".into(),
            }),
        };
        let yaml = serde_yaml_ng::to_string(&config).unwrap();
        let parsed: RunnerConfig = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
