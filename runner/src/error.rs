#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("workspace is in use by another runner: {0}")]
    Locked(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Error class reported to protocol clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sandbox(e) => e.kind(),
            Self::Config(_) => "config",
            Self::Request(_) => "invalid_request",
            Self::Locked(_) => "locked",
            Self::Internal(_) => "internal",
            Self::Io(_) => "io",
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
