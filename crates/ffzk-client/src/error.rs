//! Coordination client error types

/// Result type for coordination client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by a coordination client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Connection loss")]
    ConnectionLoss,

    #[error("Coordination service unavailable after {attempts} attempts")]
    CoordinationUnavailable { attempts: u32 },

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Not authorized for node: {0}")]
    NoAuth(String),

    #[error("Authentication failed for scheme {0}")]
    AuthFailed(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Client is closed")]
    Closed,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ClientError {
    pub fn no_node<T: Into<String>>(path: T) -> Self {
        Self::NoNode(path.into())
    }

    pub fn node_exists<T: Into<String>>(path: T) -> Self {
        Self::NodeExists(path.into())
    }

    pub fn not_empty<T: Into<String>>(path: T) -> Self {
        Self::NotEmpty(path.into())
    }

    pub fn no_auth<T: Into<String>>(path: T) -> Self {
        Self::NoAuth(path.into())
    }

    pub fn invalid_path<T: Into<String>>(path: T) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unavailable(attempts: u32) -> Self {
        Self::CoordinationUnavailable { attempts }
    }

    /// Whether the operation may succeed if retried after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::SessionExpired)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
