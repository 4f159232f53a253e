//! Periodic follower reconciliation
//!
//! Leadership edges from the latch can be missed: the first follower state
//! after startup never produces an edge, and a lost-leadership edge may be
//! dropped while the connection flaps. The reconciler compares the latch
//! with the recorded [`RoleContext`] once per tick and asks for a follower
//! assertion when they disagree.

use crate::error::Result;
use crate::latch::LeaderLatch;
use crate::role::{Role, RoleContext, RoleSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed interval between reconciliation ticks
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Read-only view of a latch used by the reconciler
pub trait LeadershipView: Send + Sync {
    fn has_leadership(&self) -> bool;
    fn current_leader_id(&self) -> Result<String>;
}

impl LeadershipView for LeaderLatch {
    fn has_leadership(&self) -> bool {
        LeaderLatch::has_leadership(self)
    }

    fn current_leader_id(&self) -> Result<String> {
        LeaderLatch::current_leader_id(self)
    }
}

/// Why a follower assertion was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assertion {
    /// First confirmed follower state since the engine started
    Initial,
    /// The latch no longer leads but the recorded role is still leader
    MissedEdge,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    role: Arc<RoleContext>,
    standby_initialized: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(role: Arc<RoleContext>) -> Self {
        Self {
            role,
            standby_initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Decide whether this tick needs a follower assertion.
    ///
    /// Nothing is asserted while the leader is unknown or while the latch
    /// holds leadership.
    pub fn tick(&self, view: &dyn LeadershipView) -> Option<Assertion> {
        if let Err(e) = view.current_leader_id() {
            tracing::debug!("Skipping reconciliation: {}", e);
            return None;
        }
        if view.has_leadership() {
            return None;
        }

        if !self.standby_initialized.swap(true, Ordering::SeqCst) {
            return Some(Assertion::Initial);
        }
        if self.role.current() == Some(Role::Leader) {
            return Some(Assertion::MissedEdge);
        }
        None
    }

    /// Apply an assertion to the role context at dispatch time.
    ///
    /// Returns the replaced state when the follower transition happened.
    /// A missed-edge assertion is dropped when a lost-leadership edge was
    /// handled in the meantime.
    pub fn apply(&self, assertion: Assertion, view: &dyn LeadershipView) -> Option<RoleSnapshot> {
        if view.has_leadership() {
            return None;
        }
        match assertion {
            Assertion::Initial => Some(self.role.transition(Role::Follower)),
            Assertion::MissedEdge => self
                .role
                .transition_if(Role::Follower, |s| s.current == Some(Role::Leader)),
        }
    }

    /// Forget that a follower state was ever asserted
    pub fn reset(&self) {
        self.standby_initialized.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ElectionError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeView {
        leading: AtomicBool,
        leader: Mutex<Option<String>>,
    }

    impl FakeView {
        fn following(leader: &str) -> Self {
            let view = Self::default();
            *view.leader.lock().unwrap() = Some(leader.to_string());
            view
        }

        fn set_leading(&self, leading: bool) {
            self.leading.store(leading, Ordering::SeqCst);
        }
    }

    impl LeadershipView for FakeView {
        fn has_leadership(&self) -> bool {
            self.leading.load(Ordering::SeqCst)
        }

        fn current_leader_id(&self) -> Result<String> {
            self.leader
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ElectionError::leader_query_failed("no leader known"))
        }
    }

    #[test]
    fn test_initial_assertion_fires_once() {
        let role = Arc::new(RoleContext::new());
        let reconciler = Reconciler::new(role.clone());
        let view = FakeView::following("other@1");

        assert_eq!(reconciler.tick(&view), Some(Assertion::Initial));
        assert!(reconciler.apply(Assertion::Initial, &view).is_some());
        assert_eq!(role.current(), Some(Role::Follower));

        for _ in 0..5 {
            assert_eq!(reconciler.tick(&view), None);
        }
    }

    #[test]
    fn test_unknown_leader_skips_tick() {
        let reconciler = Reconciler::new(Arc::new(RoleContext::new()));
        let view = FakeView::default();

        assert_eq!(reconciler.tick(&view), None);
        *view.leader.lock().unwrap() = Some("other@1".to_string());
        assert_eq!(reconciler.tick(&view), Some(Assertion::Initial));
    }

    #[test]
    fn test_leader_is_never_asserted_follower() {
        let role = Arc::new(RoleContext::new());
        role.transition(Role::Leader);
        let reconciler = Reconciler::new(role.clone());
        let view = FakeView::following("me@1");
        view.set_leading(true);

        assert_eq!(reconciler.tick(&view), None);
        assert_eq!(reconciler.apply(Assertion::Initial, &view), None);
        assert_eq!(role.current(), Some(Role::Leader));
    }

    #[test]
    fn test_missed_edge_recovers_exactly_once() {
        let role = Arc::new(RoleContext::new());
        let reconciler = Reconciler::new(role.clone());
        let view = FakeView::following("me@1");
        view.set_leading(true);
        assert_eq!(reconciler.tick(&view), None);
        role.transition(Role::Leader);

        // leadership is lost but the edge never reaches the role context
        view.set_leading(false);
        *view.leader.lock().unwrap() = Some("other@2".to_string());

        // the first confirmed follower tick is the initial assertion
        assert_eq!(reconciler.tick(&view), Some(Assertion::Initial));
        assert!(reconciler.apply(Assertion::Initial, &view).is_some());
        assert_eq!(role.previous(), Some(Role::Leader));
        assert_eq!(role.current(), Some(Role::Follower));
        assert_eq!(reconciler.tick(&view), None);

        // a second lost edge is dropped later on
        role.transition(Role::Leader);
        assert_eq!(reconciler.tick(&view), Some(Assertion::MissedEdge));
        assert!(reconciler.apply(Assertion::MissedEdge, &view).is_some());
        assert_eq!(reconciler.tick(&view), None);
        assert_eq!(role.current(), Some(Role::Follower));
    }

    #[test]
    fn test_missed_edge_dropped_after_real_edge() {
        let role = Arc::new(RoleContext::new());
        let reconciler = Reconciler::new(role.clone());
        let view = FakeView::following("other@2");
        reconciler.tick(&view);
        role.transition(Role::Leader);

        assert_eq!(reconciler.tick(&view), Some(Assertion::MissedEdge));
        // the lost-leadership edge is dispatched before the assertion
        role.transition(Role::Follower);
        assert_eq!(reconciler.apply(Assertion::MissedEdge, &view), None);
    }

    #[test]
    fn test_reset_rearms_initial_assertion() {
        let reconciler = Reconciler::new(Arc::new(RoleContext::new()));
        let view = FakeView::following("other@1");

        assert_eq!(reconciler.tick(&view), Some(Assertion::Initial));
        reconciler.reset();
        assert_eq!(reconciler.tick(&view), Some(Assertion::Initial));
    }
}
