#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("user {user_id} already has {limit} active sandboxes")]
    Capacity { user_id: String, limit: usize },

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox allocation failed: {0}")]
    Allocation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("terminal error: {0}")]
    Terminal(String),

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Stable, machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "capacity",
            Self::NotFound(_) => "not_found",
            Self::Allocation(_) => "allocation",
            Self::Execution(_) => "execution",
            Self::Terminal(_) => "terminal",
            Self::BackendNotAvailable(_) => "backend_not_available",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_names_user_and_limit() {
        let err = SandboxError::Capacity {
            user_id: "u1".into(),
            limit: 5,
        };
        assert_eq!(err.to_string(), "user u1 already has 5 active sandboxes");
        assert_eq!(err.kind(), "capacity");
    }

    #[test]
    fn io_errors_convert() {
        let err: SandboxError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("disk full"));
    }
}
