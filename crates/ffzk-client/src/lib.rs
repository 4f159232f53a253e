//! Coordination Service Client
//!
//! This crate defines the boundary between the election engine and a
//! ZooKeeper-like coordination service: the [`CoordinationClient`] trait,
//! its configuration and retry policy, a [`ClientFactory`] with best-effort
//! helpers, and an in-process [`MemoryEnsemble`] implementation.

pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod memory;
pub mod path;
pub mod retry;

pub use client::{ConnectionState, CoordinationClient, CreateMode, WatchEvent};
pub use config::{ElectionSettings, ZkConfig};
pub use error::{ClientError, Result};
pub use factory::ClientFactory;
pub use memory::{MemoryClient, MemoryEnsemble, SessionId};
pub use retry::ExponentialBackoff;
