//! Coordination service client boundary

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,

    /// Removed when the creating session ends
    Ephemeral,

    /// Persistent with a monotonically increasing suffix
    PersistentSequential,

    /// Ephemeral with a monotonically increasing suffix
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Connection state transitions reported by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First connection of the client
    Connected,

    /// Connection interrupted, the session may still be alive
    Suspended,

    /// Connection re-established after a suspension or session loss
    Reconnected,

    /// Session expired; its ephemeral nodes are gone
    Lost,

    /// Client closed locally
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Suspended => write!(f, "suspended"),
            Self::Reconnected => write!(f, "reconnected"),
            Self::Lost => write!(f, "lost"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Change to the children of a watched path, carrying the child name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ChildAdded(String),
    ChildRemoved(String),
}

impl WatchEvent {
    pub fn child(&self) -> &str {
        match self {
            Self::ChildAdded(child) | Self::ChildRemoved(child) => child,
        }
    }
}

/// Session based access to a hierarchical coordination service.
///
/// Paths are absolute and relative to the client's namespace. Operations
/// retry transient connectivity failures with the client's backoff policy and
/// fail with `CoordinationUnavailable` once it is exhausted.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Open the client; idempotent
    async fn start(&self) -> Result<()>;

    /// Close the client and its session; idempotent
    async fn close(&self) -> Result<()>;

    /// Wait for a live session, `false` on timeout
    async fn block_until_connected(&self, timeout: Duration) -> bool;

    /// Last reported connection state
    fn state(&self) -> ConnectionState;

    /// Create a node, creating missing parents as persistent nodes.
    ///
    /// Returns the actual path, which carries the sequence suffix for
    /// sequential modes.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Create `path` and its parents as persistent nodes if missing
    async fn create_containers(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete a node and its children
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the direct children of `path`
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribe to child changes of `path` until the receiver is dropped
    async fn watch_children(&self, path: &str) -> Result<broadcast::Receiver<WatchEvent>>;

    /// Subscribe to connection state changes
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;
}
