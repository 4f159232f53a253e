//! Leader Election Engine
//!
//! Elects exactly one leader among the processes that share a latch path on
//! a coordination service. Each process runs an [`ElectionEngine`], which
//! registers an ephemeral sequential node through a [`LeaderLatch`], records
//! its role in a [`RoleContext`] and invokes the registered
//! [`LeaderHandler`] or [`StandByHandler`] on every role change. A
//! reconciliation loop repairs follower state when a leadership edge is
//! missed.

pub mod engine;
pub mod error;
pub mod handler;
pub mod identity;
pub mod latch;
pub mod reconcile;
pub mod role;

pub use engine::ElectionEngine;
pub use error::{ElectionError, Result};
pub use handler::{LeaderHandler, StandByHandler};
pub use identity::participant_id;
pub use latch::{LatchEvent, LeaderLatch, Participant};
pub use reconcile::RECONCILE_INTERVAL;
pub use role::{Role, RoleContext, RoleSnapshot};
