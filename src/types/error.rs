//! Error types for the silo

/// Main error type for request authorization
#[derive(Debug, thiserror::Error)]
pub enum SiloError {
    #[error("Invalid pairing: {0}")]
    InvalidPairing(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Session removed: {0}")]
    SessionRemoved(String),

    #[error("Request already pending: {0}")]
    RequestPending(String),

    #[error("Invalid request time: {unix_seconds} (now {now})")]
    InvalidRequestTime { unix_seconds: i64, now: i64 },

    #[error("Key manager error: {0}")]
    KeyManager(String),

    #[error("User rejected request: {0}")]
    UserRejected(String),

    #[error("Approval superseded by a newer request: {0}")]
    ApprovalSuperseded(String),

    #[error("Multiple requests in one message")]
    MultipleRequests,

    #[error("Multiple responses in one message")]
    MultipleResponses,

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SiloError {
    /// Whether the transport may usefully redeliver the same message.
    ///
    /// Validation failures are final for a given request; redelivery is
    /// absorbed by the replay guard either way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Internal(_))
    }

    /// Short stable label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPairing(_) => "invalid_pairing",
            Self::Crypto(_) => "crypto",
            Self::SessionRemoved(_) => "session_removed",
            Self::RequestPending(_) => "request_pending",
            Self::InvalidRequestTime { .. } => "invalid_request_time",
            Self::KeyManager(_) => "key_manager",
            Self::UserRejected(_) => "user_rejected",
            Self::ApprovalSuperseded(_) => "approval_superseded",
            Self::MultipleRequests => "multiple_requests",
            Self::MultipleResponses => "multiple_responses",
            Self::Malformed(_) => "malformed",
            Self::Transport(_) => "transport",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for SiloError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for SiloError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(format!("JSON error: {}", err))
    }
}

impl From<base64::DecodeError> for SiloError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Malformed(format!("base64 error: {}", err))
    }
}

/// Result type alias for silo operations
pub type Result<T> = std::result::Result<T, SiloError>;
