use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid settings: {0}")]
    ConfigInvalid(String),

    #[error("subscription fetch failed: {0}")]
    FetchFailed(String),

    #[error("subscription decode failed: {0}")]
    DecodeFailed(String),

    #[error("subscription parse failed: {0}")]
    ParseFailed(String),

    #[error("subscription contains no usable servers")]
    NoServers,

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server already active: {0}")]
    AlreadyActive(String),

    #[error("another switch is in progress")]
    SwitchInProgress,

    #[error("proxy config write failed: {0}")]
    ConfigWriteFailed(String),

    #[error("proxy restart failed: {0}")]
    RestartFailed(String),

    #[error("proxy restart failed ({restart}) and config rollback failed ({rollback})")]
    RestartFailedRollbackFailed { restart: String, rollback: String },

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("unauthorised user {0}")]
    Unauthorised(i64),

    #[error("rate limited")]
    RateLimited,

    #[error("chat transport error: {0}")]
    Chat(#[from] crate::bot::transport::ChatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Get the kind/category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            AgentError::FetchFailed(_) => ErrorKind::FetchFailed,
            AgentError::DecodeFailed(_) => ErrorKind::DecodeFailed,
            AgentError::ParseFailed(_) => ErrorKind::ParseFailed,
            AgentError::NoServers => ErrorKind::NoServers,
            AgentError::ServerNotFound(_) => ErrorKind::ServerNotFound,
            AgentError::AlreadyActive(_) => ErrorKind::AlreadyActive,
            AgentError::SwitchInProgress => ErrorKind::SwitchInProgress,
            AgentError::ConfigWriteFailed(_) => ErrorKind::ConfigWriteFailed,
            AgentError::RestartFailed(_) => ErrorKind::RestartFailed,
            AgentError::RestartFailedRollbackFailed { .. } => {
                ErrorKind::RestartFailedRollbackFailed
            }
            AgentError::CommandRejected(_) => ErrorKind::CommandRejected,
            AgentError::Unauthorised(_) => ErrorKind::Unauthorised,
            AgentError::RateLimited => ErrorKind::RateLimited,
            AgentError::Chat(_) => ErrorKind::Chat,
            AgentError::Io(_) => ErrorKind::Io,
            AgentError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the supervisor must terminate the process.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    FetchFailed,
    DecodeFailed,
    ParseFailed,
    NoServers,
    ServerNotFound,
    AlreadyActive,
    SwitchInProgress,
    ConfigWriteFailed,
    RestartFailed,
    RestartFailedRollbackFailed,
    CommandRejected,
    Unauthorised,
    RateLimited,
    Chat,
    Io,
    Other,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigInvalid | ErrorKind::RestartFailedRollbackFailed
        )
    }

    /// Errors the operator sees verbatim in chat.
    pub fn is_user_facing(self) -> bool {
        matches!(
            self,
            ErrorKind::ServerNotFound
                | ErrorKind::AlreadyActive
                | ErrorKind::SwitchInProgress
                | ErrorKind::NoServers
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::FetchFailed | ErrorKind::Io)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "CONFIG_INVALID",
            ErrorKind::FetchFailed => "FETCH_FAILED",
            ErrorKind::DecodeFailed => "DECODE_FAILED",
            ErrorKind::ParseFailed => "PARSE_FAILED",
            ErrorKind::NoServers => "NO_SERVERS",
            ErrorKind::ServerNotFound => "SERVER_NOT_FOUND",
            ErrorKind::AlreadyActive => "ALREADY_ACTIVE",
            ErrorKind::SwitchInProgress => "SWITCH_IN_PROGRESS",
            ErrorKind::ConfigWriteFailed => "CONFIG_WRITE_FAILED",
            ErrorKind::RestartFailed => "RESTART_FAILED",
            ErrorKind::RestartFailedRollbackFailed => "RESTART_ROLLBACK_FAILED",
            ErrorKind::CommandRejected => "COMMAND_REJECTED",
            ErrorKind::Unauthorised => "UNAUTHORISED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Chat => "CHAT",
            ErrorKind::Io => "IO",
            ErrorKind::Other => "OTHER",
        }
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
