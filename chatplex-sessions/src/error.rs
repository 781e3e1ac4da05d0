//! Error types for session orchestration.

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session error type.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown engine '{0}'")]
    EngineNotFound(String),

    #[error("Session '{0}' already exists")]
    DuplicateSession(String),

    #[error("We didn't find a session with name '{0}'. Please start it first by using POST /api/sessions/start request")]
    SessionNotFound(String),

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session '{0}' is not connected")]
    NotReady(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Get HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::EngineNotFound(_) | Self::SessionNotFound(_) => 404,
            Self::DuplicateSession(_) | Self::NotReady(_) => 409,
            Self::InvalidAttachment(_) | Self::InvalidRequest(_) => 422,
            Self::TransportFailure(_) => 502,
            Self::StorageFailure(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::EngineNotFound(_) => "ENGINE_NOT_FOUND",
            Self::DuplicateSession(_) => "DUPLICATE_SESSION",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidAttachment(_) => "INVALID_ATTACHMENT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::NotReady(_) => "SESSION_NOT_READY",
            Self::TransportFailure(_) => "TRANSPORT_FAILURE",
            Self::StorageFailure(_) => "STORAGE_FAILURE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller caused this error.
    pub const fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageFailure(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {e}"))
    }
}
