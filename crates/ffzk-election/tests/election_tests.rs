//! Multi-participant election scenarios against an in-process ensemble

use async_trait::async_trait;
use ffzk_client::{CoordinationClient, MemoryClient, MemoryEnsemble, ZkConfig};
use ffzk_election::{ElectionEngine, LeaderHandler, Role, StandByHandler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::fmt::try_init;

/// Counts handler invocations
#[derive(Default)]
struct Recorder {
    leader: AtomicUsize,
    standby: AtomicUsize,
}

impl Recorder {
    fn leader_calls(&self) -> usize {
        self.leader.load(Ordering::SeqCst)
    }

    fn standby_calls(&self) -> usize {
        self.standby.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaderHandler for Recorder {
    async fn leader_handle(&self) -> anyhow::Result<()> {
        self.leader.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl StandByHandler for Recorder {
    async fn standby_handle(&self) -> anyhow::Result<()> {
        self.standby.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config() -> ZkConfig {
    let mut config = ZkConfig::new("memory:2181");
    config.base_sleep_time_milliseconds = 1;
    config.max_sleep_time_milliseconds = 5;
    config.max_retries = 2;
    config.election.enable = true;
    config
}

struct Node {
    client: Arc<MemoryClient>,
    engine: ElectionEngine,
    recorder: Arc<Recorder>,
}

async fn start_node(ensemble: &Arc<MemoryEnsemble>, id: &str) -> Node {
    let client = Arc::new(MemoryClient::new(ensemble.clone(), &test_config()));
    client.start().await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let engine = ElectionEngine::new(client.clone(), "/leader", id)
        .with_leader_handler(recorder.clone())
        .with_standby_handler(recorder.clone());
    engine.init().await;

    Node {
        client,
        engine,
        recorder,
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_node_becomes_leader() {
    let _ = try_init();
    let ensemble = MemoryEnsemble::new();

    let a = start_node(&ensemble, "a@1").await;
    sleep(Duration::from_secs(3)).await;

    assert!(a.engine.is_leader());
    assert_eq!(a.engine.current_leader_id().as_deref(), Some("a@1"));
    assert_eq!(a.recorder.leader_calls(), 1);
    assert_eq!(a.recorder.standby_calls(), 0);

    a.engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_exactly_one_leader_among_many() {
    let _ = try_init();
    let ensemble = MemoryEnsemble::new();

    let mut nodes = Vec::new();
    for i in 0..4 {
        nodes.push(start_node(&ensemble, &format!("node-{}@{}", i, i)).await);
    }
    sleep(Duration::from_secs(3)).await;

    let leaders: Vec<&Node> = nodes.iter().filter(|n| n.engine.is_leader()).collect();
    assert_eq!(leaders.len(), 1);
    let leader_id = leaders[0].engine.participant_id().to_string();

    for node in &nodes {
        assert_eq!(node.engine.current_leader_id(), Some(leader_id.clone()));
        if node.engine.is_leader() {
            assert_eq!(node.engine.role().current, Some(Role::Leader));
        } else {
            assert_eq!(node.engine.role().current, Some(Role::Follower));
            assert_eq!(node.recorder.standby_calls(), 1);
        }
    }

    for node in &nodes {
        node.engine.close().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_failover_after_session_expiry() {
    let _ = try_init();
    let ensemble = MemoryEnsemble::new();

    let a = start_node(&ensemble, "a@1").await;
    sleep(Duration::from_secs(1)).await;
    let b = start_node(&ensemble, "b@2").await;
    sleep(Duration::from_secs(2)).await;

    assert!(a.engine.is_leader());
    assert!(!b.engine.is_leader());
    assert_eq!(b.recorder.standby_calls(), 1);

    ensemble.expire_session(a.client.session_id().unwrap());
    sleep(Duration::from_secs(1)).await;

    assert!(b.engine.is_leader());
    assert_eq!(b.recorder.leader_calls(), 1);
    assert_eq!(b.engine.role().previous, Some(Role::Follower));
    assert_eq!(b.engine.role().current, Some(Role::Leader));

    assert!(!a.engine.is_leader());
    assert_eq!(a.recorder.standby_calls(), 1);
    assert_eq!(a.engine.current_leader_id().as_deref(), Some("b@2"));
    assert_eq!(ensemble.children_of("/ffzk/leader").len(), 2);

    a.engine.close().await;
    b.engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_node_makes_no_assertion() {
    let _ = try_init();
    let ensemble = MemoryEnsemble::new();

    let a = start_node(&ensemble, "a@1").await;
    let b = start_node(&ensemble, "b@2").await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(b.recorder.standby_calls(), 1);

    ensemble.partition(b.client.session_id().unwrap());
    sleep(Duration::from_millis(100)).await;

    assert_eq!(b.engine.current_leader_id(), None);
    // pretend a leadership edge slipped through; nothing may be asserted
    // while the leader is unknown
    b.engine.role_context().transition(Role::Leader);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(b.recorder.standby_calls(), 1);
    assert_eq!(b.engine.role().current, Some(Role::Leader));

    ensemble.heal(b.client.session_id().unwrap());
    sleep(Duration::from_secs(2)).await;
    assert_eq!(b.engine.current_leader_id().as_deref(), Some("a@1"));
    assert_eq!(b.recorder.standby_calls(), 2);
    assert_eq!(b.engine.role().current, Some(Role::Follower));

    a.engine.close().await;
    b.engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_lost_edge_is_recovered_once() {
    let _ = try_init();
    let ensemble = MemoryEnsemble::new();

    let a = start_node(&ensemble, "a@1").await;
    let b = start_node(&ensemble, "b@2").await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(b.recorder.standby_calls(), 1);

    // b believes it still leads although its latch follows
    b.engine.role_context().transition(Role::Leader);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(b.recorder.standby_calls(), 2);
    assert_eq!(b.engine.role().previous, Some(Role::Leader));
    assert_eq!(b.engine.role().current, Some(Role::Follower));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(b.recorder.standby_calls(), 2);

    a.engine.close().await;
    b.engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_reelection() {
    let _ = try_init();
    let ensemble = MemoryEnsemble::new();

    let a = start_node(&ensemble, "a@1").await;
    let b = start_node(&ensemble, "b@2").await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(b.recorder.standby_calls(), 1);

    b.engine.reelection().await;
    b.engine.reelection().await;
    sleep(Duration::from_secs(2)).await;

    let children = ensemble.children_of("/ffzk/leader");
    assert_eq!(children.len(), 2);
    assert!(a.engine.is_leader());
    assert!(!b.engine.is_leader());
    assert_eq!(b.engine.current_leader_id().as_deref(), Some("a@1"));

    // a settled restart confirms follower state exactly once
    let settled = b.recorder.standby_calls();
    b.engine.reelection().await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(b.recorder.standby_calls(), settled + 1);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(b.recorder.standby_calls(), settled + 1);

    a.engine.reelection().await;
    a.engine.reelection().await;
    sleep(Duration::from_secs(2)).await;

    assert_eq!(ensemble.children_of("/ffzk/leader").len(), 2);
    assert!(b.engine.is_leader());
    assert!(!a.engine.is_leader());

    a.engine.close().await;
    b.engine.close().await;
    assert!(ensemble.children_of("/ffzk/leader").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_closed_engine_stops_callbacks() {
    let _ = try_init();
    let ensemble = MemoryEnsemble::new();

    let a = start_node(&ensemble, "a@1").await;
    let b = start_node(&ensemble, "b@2").await;
    sleep(Duration::from_secs(2)).await;

    b.engine.close().await;
    let before = (b.recorder.leader_calls(), b.recorder.standby_calls());

    a.engine.close().await;
    sleep(Duration::from_secs(3)).await;

    assert_eq!(
        (b.recorder.leader_calls(), b.recorder.standby_calls()),
        before
    );
    assert!(!b.engine.is_leader());
    assert_eq!(b.engine.current_leader_id(), None);
}
