use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Effective limits for one sandbox, after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu_percent: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub time_limit_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_percent: 50,
            memory_mb: 512,
            disk_mb: 1024,
            time_limit_secs: 3600,
        }
    }
}

/// A sandbox creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub user_id: String,
    pub project_id: String,
    /// Project of the same user whose files seed the sandbox.
    #[serde(default)]
    pub base_from: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<u32>,
    /// Memory cap in MB.
    #[serde(default)]
    pub memory_limit: Option<u64>,
    /// Disk cap in MB.
    #[serde(default)]
    pub disk_limit: Option<u64>,
    /// Time-to-live in seconds.
    #[serde(default)]
    pub time_limit: Option<u64>,
}

impl SandboxConfig {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Reject identifiers that cannot be used as a single path component.
    pub fn validate(&self) -> Result<()> {
        check_component("user_id", &self.user_id)?;
        check_component("project_id", &self.project_id)?;
        if let Some(base) = &self.base_from {
            check_component("base_from", base)?;
        }
        if self.time_limit == Some(0) {
            return Err(SandboxError::InvalidConfig(
                "time_limit must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    /// Merge the request's optional caps over `defaults`.
    pub fn limits(&self, defaults: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_percent: self.cpu_limit.unwrap_or(defaults.cpu_percent),
            memory_mb: self.memory_limit.unwrap_or(defaults.memory_mb),
            disk_mb: self.disk_limit.unwrap_or(defaults.disk_mb),
            time_limit_secs: self.time_limit.unwrap_or(defaults.time_limit_secs),
        }
    }
}

fn check_component(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidConfig(format!(
            "{field} must be a non-empty name of [A-Za-z0-9._-]: {value:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_fall_back_to_defaults() {
        let config = SandboxConfig {
            memory_limit: Some(256),
            time_limit: Some(10),
            ..SandboxConfig::new("u1", "p1")
        };
        let limits = config.limits(&ResourceLimits::default());
        assert_eq!(limits.cpu_percent, 50);
        assert_eq!(limits.memory_mb, 256);
        assert_eq!(limits.disk_mb, 1024);
        assert_eq!(limits.time_limit_secs, 10);
    }

    #[test]
    fn validate_accepts_plain_names() {
        let config = SandboxConfig {
            base_from: Some("main-app_v2".into()),
            ..SandboxConfig::new("user.42", "calc")
        };
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_path_traversal() {
        for bad in ["", ".", "..", "a/b", "../etc", "x y"] {
            let err = SandboxConfig::new(bad, "p").validate().unwrap_err();
            assert_eq!(err.kind(), "invalid_config", "accepted {bad:?}");
        }
        let err = SandboxConfig {
            base_from: Some("../other".into()),
            ..SandboxConfig::new("u", "p")
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("base_from"));
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let config = SandboxConfig {
            time_limit: Some(0),
            ..SandboxConfig::new("u", "p")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_camel_case_request() {
        let json = r#"{"userId":"u1","projectId":"p1","baseFrom":"main","memoryLimit":128,"timeLimit":1}"#;
        let config: SandboxConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.user_id, "u1");
        assert_eq!(config.base_from.as_deref(), Some("main"));
        assert_eq!(config.memory_limit, Some(128));
        assert_eq!(config.cpu_limit, None);
        assert_eq!(config.time_limit, Some(1));
    }
}
