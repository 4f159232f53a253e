//! Leader latch over ephemeral sequential nodes
//!
//! Every participant creates `{latch_path}/latch-NNNNNNNNNN` holding its id.
//! The participant owning the lowest sequence is the leader. The latch
//! watches the children of `latch_path` and the client's connection state,
//! re-evaluates ordering on every change, and reports a [`LatchEvent`] only
//! when its own leadership flips.

use crate::error::{ElectionError, Result};
use ffzk_client::{path, ClientError, ConnectionState, CoordinationClient, CreateMode, WatchEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Name prefix of participant nodes
pub const LATCH_PREFIX: &str = "latch-";

/// Leadership edge raised by a latch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchEvent {
    LeaderAcquired,
    LeaderLost,
}

/// A contender registered under the latch path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub sequence: u64,
    pub node_path: String,
}

enum Evaluation {
    Ranked,
    Missing,
}

pub struct LeaderLatch {
    client: Arc<dyn CoordinationClient>,
    latch_path: String,
    id: String,
    has_leadership: AtomicBool,
    closed: AtomicBool,
    participant: RwLock<Option<Participant>>,
    leader_id: RwLock<Option<String>>,
    listener: mpsc::UnboundedSender<LatchEvent>,
    // serializes node (re)creation with ordering checks
    ops: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl LeaderLatch {
    /// Join the election under `latch_path` as `id`.
    ///
    /// Edges are sent to `listener`. Fails when the participant node cannot
    /// be created, typically with a coordination-unavailable error.
    pub async fn start(
        client: Arc<dyn CoordinationClient>,
        latch_path: &str,
        id: &str,
        listener: mpsc::UnboundedSender<LatchEvent>,
    ) -> Result<Arc<Self>> {
        path::validate(latch_path)?;

        let latch = Arc::new(Self {
            client,
            latch_path: latch_path.to_string(),
            id: id.to_string(),
            has_leadership: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            participant: RwLock::new(None),
            leader_id: RwLock::new(None),
            listener,
            ops: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        // subscribe before creating our node so no change is missed
        let children = latch.client.watch_children(latch_path).await?;
        let connection = latch.client.connection_events();
        let handle = tokio::spawn(watch_loop(
            Arc::downgrade(&latch),
            children,
            connection,
            latch.cancel.clone(),
        ));
        *latch.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let started = {
            let _guard = latch.ops.lock().await;
            latch.reset_locked().await
        };
        if let Err(e) = started {
            latch.close().await;
            return Err(e);
        }

        tracing::info!(
            "Participant {} joined election under {}",
            latch.id,
            latch.latch_path
        );
        Ok(latch)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn latch_path(&self) -> &str {
        &self.latch_path
    }

    /// Whether this participant holds the lowest sequence. Cached, never
    /// touches the network.
    pub fn has_leadership(&self) -> bool {
        self.has_leadership.load(Ordering::SeqCst)
    }

    /// Id of the current leader from the cached view
    pub fn current_leader_id(&self) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ElectionError::LatchClosed);
        }
        let state = self.client.state();
        if !state.is_connected() {
            return Err(ElectionError::leader_query_failed(format!(
                "connection is {}",
                state
            )));
        }
        self.leader_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ElectionError::leader_query_failed("no leader known"))
    }

    /// This latch's own node, once created
    pub fn participant(&self) -> Option<Participant> {
        self.participant
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every participant currently registered, leader first
    pub async fn participants(&self) -> Result<Vec<Participant>> {
        let mut participants = Vec::new();
        for (sequence, name) in self.ordered_children().await? {
            let node_path = path::join(&self.latch_path, &name);
            match self.client.read(&node_path).await {
                Ok(data) => participants.push(Participant {
                    id: String::from_utf8_lossy(&data).into_owned(),
                    sequence,
                    node_path,
                }),
                Err(ClientError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(participants)
    }

    /// Re-read the participants and update leadership.
    ///
    /// Raises an event only when leadership flips, so repeated calls with an
    /// unchanged ordering are silent. Recreates this participant's node if it
    /// disappeared.
    pub async fn check_leadership(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.participant().is_none() {
            return self.reset_locked().await;
        }

        match self.evaluate().await {
            Ok(Evaluation::Ranked) => Ok(()),
            Ok(Evaluation::Missing) => {
                tracing::warn!(
                    "Node of participant {} is gone, rejoining election",
                    self.id
                );
                self.reset_locked().await
            }
            Err(e) => {
                self.set_leader_id(None);
                Err(e)
            }
        }
    }

    /// Leave the election. Removes our node without raising an event;
    /// idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let _guard = self.ops.lock().await;
        self.has_leadership.store(false, Ordering::SeqCst);
        self.set_leader_id(None);

        let participant = self
            .participant
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(participant) = participant {
            match self.client.delete(&participant.node_path).await {
                Ok(()) | Err(ClientError::NoNode(_)) => {}
                Err(e) => tracing::warn!(
                    "Failed to delete latch node {}: {}",
                    participant.node_path,
                    e
                ),
            }
        }
        tracing::info!("Participant {} left election", self.id);
    }

    async fn handle_state_change(&self, state: ConnectionState) {
        tracing::debug!("Latch {} saw connection {}", self.id, state);
        match state {
            ConnectionState::Suspended | ConnectionState::Lost | ConnectionState::Closed => {
                self.set_leader_id(None);
                self.set_leadership(false);
            }
            ConnectionState::Connected | ConnectionState::Reconnected => {
                if let Err(e) = self.check_leadership().await {
                    tracing::error!("Leadership check after reconnect failed: {}", e);
                }
            }
        }
    }

    /// Replace our node with a fresh one and evaluate ordering.
    /// Caller holds `ops`.
    async fn reset_locked(&self) -> Result<()> {
        self.set_leadership(false);

        let previous = self.participant();
        if let Some(previous) = previous {
            match self.client.delete(&previous.node_path).await {
                Ok(()) | Err(ClientError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
            *self
                .participant
                .write()
                .unwrap_or_else(PoisonError::into_inner) = None;
        }

        let prefix = path::join(&self.latch_path, LATCH_PREFIX);
        let created = self
            .client
            .create(&prefix, self.id.as_bytes(), CreateMode::EphemeralSequential)
            .await?;
        let sequence = path::sequence_of(path::node_name(&created)).ok_or_else(|| {
            ElectionError::leader_query_failed(format!("{} has no sequence", created))
        })?;
        tracing::debug!("Participant {} created {}", self.id, created);

        *self
            .participant
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Participant {
            id: self.id.clone(),
            sequence,
            node_path: created,
        });

        match self.evaluate().await? {
            Evaluation::Ranked => Ok(()),
            Evaluation::Missing => Err(ElectionError::leader_query_failed(
                "participant node vanished right after creation",
            )),
        }
    }

    async fn ordered_children(&self) -> Result<Vec<(u64, String)>> {
        let mut ordered: Vec<(u64, String)> = self
            .client
            .children(&self.latch_path)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(LATCH_PREFIX))
            .filter_map(|name| path::sequence_of(&name).map(|seq| (seq, name)))
            .collect();
        ordered.sort();
        Ok(ordered)
    }

    async fn evaluate(&self) -> Result<Evaluation> {
        let Some(ours) = self.participant() else {
            return Ok(Evaluation::Missing);
        };
        let our_name = path::node_name(&ours.node_path);

        let ordered = self.ordered_children().await?;
        let Some(rank) = ordered.iter().position(|(_, name)| name == our_name) else {
            return Ok(Evaluation::Missing);
        };

        let leader_id = if rank == 0 {
            Some(self.id.clone())
        } else {
            let leader_path = path::join(&self.latch_path, &ordered[0].1);
            match self.client.read(&leader_path).await {
                Ok(data) => Some(String::from_utf8_lossy(&data).into_owned()),
                // the leader left between listing and reading; its removal
                // triggers another evaluation
                Err(ClientError::NoNode(_)) => None,
                Err(e) => return Err(e.into()),
            }
        };

        self.set_leader_id(leader_id);
        self.set_leadership(rank == 0);
        Ok(Evaluation::Ranked)
    }

    fn set_leader_id(&self, leader_id: Option<String>) {
        *self
            .leader_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = leader_id;
    }

    fn set_leadership(&self, leader: bool) {
        let old = self.has_leadership.swap(leader, Ordering::SeqCst);
        if old == leader || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let event = if leader {
            LatchEvent::LeaderAcquired
        } else {
            LatchEvent::LeaderLost
        };
        tracing::debug!("Participant {} raised {:?}", self.id, event);
        let _ = self.listener.send(event);
    }
}

impl Drop for LeaderLatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch_loop(
    latch: Weak<LeaderLatch>,
    mut children: broadcast::Receiver<WatchEvent>,
    mut connection: broadcast::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    enum Trigger {
        Children,
        State(ConnectionState),
    }

    loop {
        let trigger = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            state = connection.recv() => match state {
                Ok(state) => Trigger::State(state),
                Err(broadcast::error::RecvError::Lagged(_)) => Trigger::Children,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = children.recv() => match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Trigger::Children,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let Some(latch) = latch.upgrade() else {
            break;
        };
        match trigger {
            Trigger::State(state) => latch.handle_state_change(state).await,
            Trigger::Children => {
                if let Err(e) = latch.check_leadership().await {
                    tracing::warn!("Leadership check for {} failed: {}", latch.id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffzk_client::{MemoryClient, MemoryEnsemble, ZkConfig};

    fn fast_config() -> ZkConfig {
        let mut config = ZkConfig::new("memory:2181");
        config.base_sleep_time_milliseconds = 1;
        config.max_sleep_time_milliseconds = 5;
        config.max_retries = 2;
        config
    }

    async fn client(ensemble: &Arc<MemoryEnsemble>) -> Arc<MemoryClient> {
        let client = Arc::new(MemoryClient::new(ensemble.clone(), &fast_config()));
        client.start().await.unwrap();
        client
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LatchEvent>) -> Vec<LatchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_single_participant_leads() {
        let ensemble = MemoryEnsemble::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latch = LeaderLatch::start(client(&ensemble).await, "/leader", "a@1", tx)
            .await
            .unwrap();

        assert!(latch.has_leadership());
        assert_eq!(latch.current_leader_id().unwrap(), "a@1");
        assert_eq!(latch.participant().unwrap().sequence, 0);
        assert_eq!(drain(&mut rx), vec![LatchEvent::LeaderAcquired]);

        latch.close().await;
    }

    #[tokio::test]
    async fn test_second_participant_follows() {
        let ensemble = MemoryEnsemble::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = LeaderLatch::start(client(&ensemble).await, "/leader", "a@1", tx_a)
            .await
            .unwrap();
        let b = LeaderLatch::start(client(&ensemble).await, "/leader", "b@2", tx_b)
            .await
            .unwrap();

        assert!(a.has_leadership());
        assert!(!b.has_leadership());
        assert_eq!(b.current_leader_id().unwrap(), "a@1");
        assert!(drain(&mut rx_b).is_empty());

        let ids: Vec<String> = b.participants().await.unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a@1".to_string(), "b@2".to_string()]);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_repeated_check_is_silent() {
        let ensemble = MemoryEnsemble::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latch = LeaderLatch::start(client(&ensemble).await, "/leader", "a@1", tx)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec![LatchEvent::LeaderAcquired]);

        latch.check_leadership().await.unwrap();
        latch.check_leadership().await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(latch.has_leadership());

        latch.close().await;
    }

    #[tokio::test]
    async fn test_close_is_silent_and_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latch = LeaderLatch::start(client(&ensemble).await, "/leader", "a@1", tx)
            .await
            .unwrap();
        drain(&mut rx);

        latch.close().await;
        latch.close().await;

        assert!(!latch.has_leadership());
        assert!(latch.current_leader_id().is_err());
        assert!(latch.participant().is_none());
        assert!(drain(&mut rx).is_empty());
        assert!(ensemble.children_of("/ffzk/leader").is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_when_unavailable() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble).await;
        ensemble.set_available(false);

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = LeaderLatch::start(client, "/leader", "a@1", tx).await;
        assert!(matches!(
            result,
            Err(ElectionError::CoordinationUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_suspension_clears_leader_view() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble).await;
        let session = client.session_id().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latch = LeaderLatch::start(client, "/leader", "a@1", tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(LatchEvent::LeaderAcquired));

        ensemble.partition(session);
        assert!(latch.current_leader_id().is_err());
        assert_eq!(rx.recv().await, Some(LatchEvent::LeaderLost));
        assert!(!latch.has_leadership());

        ensemble.heal(session);
        assert_eq!(rx.recv().await, Some(LatchEvent::LeaderAcquired));
        assert_eq!(latch.current_leader_id().unwrap(), "a@1");

        latch.close().await;
    }

    #[tokio::test]
    async fn test_expired_session_rejoins() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble).await;
        let session = client.session_id().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latch = LeaderLatch::start(client.clone(), "/leader", "a@1", tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(LatchEvent::LeaderAcquired));
        let before = latch.participant().unwrap();

        ensemble.expire_session(session);
        assert_eq!(rx.recv().await, Some(LatchEvent::LeaderLost));
        assert_eq!(rx.recv().await, Some(LatchEvent::LeaderAcquired));

        let after = latch.participant().unwrap();
        assert!(after.sequence > before.sequence);
        assert_ne!(client.session_id(), Some(session));
        assert_eq!(ensemble.children_of("/ffzk/leader").len(), 1);

        latch.close().await;
    }
}
