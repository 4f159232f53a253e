//! Role of this process and its last transition

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Role of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

const UNSET: u8 = 0;
const FOLLOWER: u8 = 1;
const LEADER: u8 = 2;

fn encode(role: Option<Role>) -> u8 {
    match role {
        None => UNSET,
        Some(Role::Follower) => FOLLOWER,
        Some(Role::Leader) => LEADER,
    }
}

fn decode(bits: u8) -> Option<Role> {
    match bits {
        FOLLOWER => Some(Role::Follower),
        LEADER => Some(Role::Leader),
        _ => None,
    }
}

fn pack(previous: Option<Role>, current: Option<Role>) -> u8 {
    (encode(previous) << 2) | encode(current)
}

fn unpack(word: u8) -> RoleSnapshot {
    RoleSnapshot {
        previous: decode(word >> 2),
        current: decode(word & 0b11),
    }
}

/// Consistent view of a [`RoleContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleSnapshot {
    pub previous: Option<Role>,
    pub current: Option<Role>,
}

impl fmt::Display for RoleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |role: Option<Role>| role.map_or("none".to_string(), |r| r.to_string());
        write!(f, "{} -> {}", show(self.previous), show(self.current))
    }
}

/// Last two roles of this process.
///
/// Both roles live in one atomic byte, so a transition moves `current` into
/// `previous` and stores the new role in a single swap and readers never see
/// half of it.
#[derive(Debug, Default)]
pub struct RoleContext {
    word: AtomicU8,
}

impl RoleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RoleSnapshot {
        unpack(self.word.load(Ordering::Acquire))
    }

    pub fn current(&self) -> Option<Role> {
        self.snapshot().current
    }

    pub fn previous(&self) -> Option<Role> {
        self.snapshot().previous
    }

    /// Record a transition to `role`, returning the state it replaced
    pub fn transition(&self, role: Role) -> RoleSnapshot {
        let old = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let current = unpack(word).current;
                Some(pack(current, Some(role)))
            })
            .unwrap_or_else(|word| word);
        unpack(old)
    }

    /// Record a transition to `role` only if `predicate` holds for the state
    /// at the moment of the swap
    pub fn transition_if<P>(&self, role: Role, predicate: P) -> Option<RoleSnapshot>
    where
        P: Fn(RoleSnapshot) -> bool,
    {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let snapshot = unpack(word);
                predicate(snapshot).then(|| pack(snapshot.current, Some(role)))
            })
            .ok()
            .map(unpack)
    }
}
