//! Election error types

use ffzk_client::ClientError;

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Election-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Failed to create path {path}: {reason}")]
    PathCreationFailed { path: String, reason: String },

    #[error("Current leader not available: {0}")]
    LeaderQueryFailed(String),

    #[error("Handler {handler} failed: {reason}")]
    HandlerInvocationFailed {
        handler: &'static str,
        reason: String,
    },

    #[error("Latch is closed")]
    LatchClosed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Coordination client error: {0}")]
    Client(ClientError),
}

impl ElectionError {
    pub fn path_creation_failed<P: Into<String>, R: ToString>(path: P, reason: R) -> Self {
        Self::PathCreationFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn leader_query_failed<T: Into<String>>(msg: T) -> Self {
        Self::LeaderQueryFailed(msg.into())
    }

    pub fn handler_failed<R: ToString>(handler: &'static str, reason: R) -> Self {
        Self::HandlerInvocationFailed {
            handler,
            reason: reason.to_string(),
        }
    }
}

impl From<ClientError> for ElectionError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::CoordinationUnavailable { .. }
            | ClientError::ConnectionLoss
            | ClientError::AuthFailed(_) => Self::CoordinationUnavailable(err.to_string()),
            ClientError::Configuration(msg) => Self::Configuration(msg),
            other => Self::Client(other),
        }
    }
}
