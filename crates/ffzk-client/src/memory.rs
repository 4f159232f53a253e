//! In-process coordination service
//!
//! [`MemoryEnsemble`] keeps a node tree with sessions, ephemeral and
//! sequential nodes, child watches and digest ACLs. [`MemoryClient`] is a
//! [`CoordinationClient`] bound to an ensemble. The ensemble also exposes
//! fault injection (service outage, per-session partitions, session expiry)
//! so election behaviour can be exercised without a real ensemble.

use crate::client::{ConnectionState, CoordinationClient, CreateMode, WatchEvent};
use crate::config::ZkConfig;
use crate::error::{ClientError, Result};
use crate::path;
use crate::retry::{call_with_retry, ExponentialBackoff};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Identifier of a session held by a client
pub type SessionId = u64;

const WATCH_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct ZNode {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
    /// Digest of the creator when created by an authenticated session
    acl: Option<String>,
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>, acl: Option<String>) -> Self {
        Self {
            data,
            ephemeral_owner,
            acl,
            next_sequence: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Expired,
    Closed,
}

#[derive(Debug)]
struct SessionRecord {
    status: SessionStatus,
    partitioned: bool,
    digest: Option<String>,
    timeout: Duration,
    events: broadcast::Sender<ConnectionState>,
}

impl SessionRecord {
    fn notify(&self, state: ConnectionState) {
        let _ = self.events.send(state);
    }
}

#[derive(Debug)]
struct EnsembleState {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<SessionId, SessionRecord>,
    watches: HashMap<String, broadcast::Sender<WatchEvent>>,
    credentials: Vec<String>,
    next_session: SessionId,
    available: bool,
}

impl EnsembleState {
    fn check_session(&self, session: SessionId) -> Result<&SessionRecord> {
        if !self.available {
            return Err(ClientError::ConnectionLoss);
        }
        let record = self
            .sessions
            .get(&session)
            .ok_or(ClientError::SessionExpired)?;
        match record.status {
            SessionStatus::Active if record.partitioned => Err(ClientError::ConnectionLoss),
            SessionStatus::Active => Ok(record),
            SessionStatus::Expired => Err(ClientError::SessionExpired),
            SessionStatus::Closed => Err(ClientError::Closed),
        }
    }

    fn session_digest(&self, session: SessionId) -> Option<String> {
        self.sessions.get(&session).and_then(|r| r.digest.clone())
    }

    fn check_acl(&self, node_path: &str, digest: Option<&str>) -> Result<()> {
        match self.nodes.get(node_path).and_then(|n| n.acl.as_deref()) {
            Some(owner) if Some(owner) != digest => Err(ClientError::no_auth(node_path)),
            _ => Ok(()),
        }
    }

    fn notify_watchers(&self, parent: &str, event: WatchEvent) {
        if let Some(sender) = self.watches.get(parent) {
            let _ = sender.send(event);
        }
    }

    fn child_names(&self, parent: &str) -> Vec<String> {
        let prefix = if path::is_root(parent) {
            "/".to_string()
        } else {
            format!("{}/", parent)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn descendants(&self, node_path: &str) -> Vec<String> {
        let prefix = format!("{}/", node_path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn insert_node(&mut self, node_path: String, node: ZNode) {
        if let Some(parent) = path::parent(&node_path) {
            let event = WatchEvent::ChildAdded(path::node_name(&node_path).to_string());
            self.notify_watchers(parent, event);
        }
        self.nodes.insert(node_path, node);
    }

    fn remove_node(&mut self, node_path: &str) {
        if self.nodes.remove(node_path).is_some() {
            if let Some(parent) = path::parent(node_path) {
                let event = WatchEvent::ChildRemoved(path::node_name(node_path).to_string());
                self.notify_watchers(parent, event);
            }
        }
    }

    /// Remove a node and everything below it, deepest first
    fn remove_tree(&mut self, node_path: &str) {
        let mut doomed = self.descendants(node_path);
        doomed.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        for p in doomed {
            self.remove_node(&p);
        }
        self.remove_node(node_path);
    }

    fn remove_ephemerals(&mut self, session: SessionId) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(key, _)| key.clone())
            .collect();
        for p in &owned {
            self.remove_tree(p);
        }
        owned.len()
    }
}

/// In-process ZooKeeper-like coordination service
#[derive(Debug)]
pub struct MemoryEnsemble {
    state: Mutex<EnsembleState>,
}

impl MemoryEnsemble {
    /// Create an ensemble accepting anonymous sessions
    pub fn new() -> Arc<Self> {
        Self::with_credentials(Vec::new())
    }

    /// Create an ensemble that only accepts the given `user:password` digests
    /// from authenticating clients. Anonymous clients are still accepted but
    /// cannot touch nodes created by authenticated ones.
    pub fn with_credentials(credentials: Vec<String>) -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None, None));

        Arc::new(Self {
            state: Mutex::new(EnsembleState {
                nodes,
                sessions: HashMap::new(),
                watches: HashMap::new(),
                credentials,
                next_session: 1,
                available: true,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_session(
        &self,
        digest: Option<String>,
        timeout: Duration,
        events: broadcast::Sender<ConnectionState>,
    ) -> Result<SessionId> {
        let mut state = self.lock();
        if !state.available {
            return Err(ClientError::ConnectionLoss);
        }
        if let Some(d) = &digest {
            if !state.credentials.iter().any(|c| c == d) {
                return Err(ClientError::AuthFailed("digest".to_string()));
            }
        }

        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            SessionRecord {
                status: SessionStatus::Active,
                partitioned: false,
                digest,
                timeout,
                events,
            },
        );
        tracing::debug!("Opened session {:#x}", id);
        Ok(id)
    }

    fn close_session(&self, session: SessionId) {
        let mut state = self.lock();
        let removed = state.remove_ephemerals(session);
        if let Some(record) = state.sessions.get_mut(&session) {
            record.status = SessionStatus::Closed;
        }
        tracing::debug!(
            "Closed session {:#x}, removed {} ephemeral nodes",
            session,
            removed
        );
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        self.lock().check_session(session).map(|_| ())
    }

    fn create(
        &self,
        session: SessionId,
        node_path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        path::validate(node_path)?;
        if path::is_root(node_path) {
            return Err(ClientError::node_exists(node_path));
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        state.check_session(session)?;
        let digest = state.session_digest(session);

        for ancestor in path::ancestors(node_path) {
            let ephemeral = state
                .nodes
                .get(&ancestor)
                .map(|node| node.ephemeral_owner.is_some());
            match ephemeral {
                Some(true) => {
                    return Err(ClientError::invalid_path(format!(
                        "{} is ephemeral and cannot have children",
                        ancestor
                    )));
                }
                Some(false) => {}
                None => {
                    if let Some(parent) = path::parent(&ancestor) {
                        state.check_acl(parent, digest.as_deref())?;
                    }
                    state.insert_node(ancestor, ZNode::new(Vec::new(), None, digest.clone()));
                }
            }
        }

        let parent = path::parent(node_path)
            .ok_or_else(|| ClientError::invalid_path(node_path))?
            .to_string();
        if state.nodes.get(&parent).is_some_and(|n| n.ephemeral_owner.is_some()) {
            return Err(ClientError::invalid_path(format!(
                "{} is ephemeral and cannot have children",
                parent
            )));
        }
        state.check_acl(&parent, digest.as_deref())?;

        let actual = if mode.is_sequential() {
            let parent_node = state
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| ClientError::no_node(parent.clone()))?;
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{:0width$}", node_path, sequence, width = path::SEQUENCE_DIGITS)
        } else {
            node_path.to_string()
        };

        if state.nodes.contains_key(&actual) {
            return Err(ClientError::node_exists(actual));
        }

        let owner = mode.is_ephemeral().then_some(session);
        state.insert_node(actual.clone(), ZNode::new(data.to_vec(), owner, digest));
        Ok(actual)
    }

    fn exists(&self, session: SessionId, node_path: &str) -> Result<bool> {
        path::validate(node_path)?;
        let state = self.lock();
        state.check_session(session)?;
        Ok(state.nodes.contains_key(node_path))
    }

    fn read(&self, session: SessionId, node_path: &str) -> Result<Vec<u8>> {
        path::validate(node_path)?;
        let state = self.lock();
        state.check_session(session)?;
        state.check_acl(node_path, state.session_digest(session).as_deref())?;
        state
            .nodes
            .get(node_path)
            .map(|n| n.data.clone())
            .ok_or_else(|| ClientError::no_node(node_path))
    }

    fn write(&self, session: SessionId, node_path: &str, data: &[u8]) -> Result<()> {
        path::validate(node_path)?;
        let mut state = self.lock();
        state.check_session(session)?;
        state.check_acl(node_path, state.session_digest(session).as_deref())?;
        let node = state
            .nodes
            .get_mut(node_path)
            .ok_or_else(|| ClientError::no_node(node_path))?;
        node.data = data.to_vec();
        Ok(())
    }

    fn delete(&self, session: SessionId, node_path: &str) -> Result<()> {
        path::validate(node_path)?;
        if path::is_root(node_path) {
            return Err(ClientError::invalid_path("the root cannot be deleted"));
        }
        let mut state = self.lock();
        state.check_session(session)?;
        state.check_acl(node_path, state.session_digest(session).as_deref())?;
        if !state.nodes.contains_key(node_path) {
            return Err(ClientError::no_node(node_path));
        }
        state.remove_tree(node_path);
        Ok(())
    }

    fn children(&self, session: SessionId, node_path: &str) -> Result<Vec<String>> {
        path::validate(node_path)?;
        let state = self.lock();
        state.check_session(session)?;
        state.check_acl(node_path, state.session_digest(session).as_deref())?;
        if !state.nodes.contains_key(node_path) {
            return Err(ClientError::no_node(node_path));
        }
        Ok(state.child_names(node_path))
    }

    fn watch_children(&self, node_path: &str) -> broadcast::Receiver<WatchEvent> {
        let mut state = self.lock();
        state
            .watches
            .entry(node_path.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn session_state(&self, session: SessionId) -> ConnectionState {
        let state = self.lock();
        match state.sessions.get(&session) {
            Some(record) => match record.status {
                SessionStatus::Active if state.available && !record.partitioned => {
                    ConnectionState::Connected
                }
                SessionStatus::Active => ConnectionState::Suspended,
                SessionStatus::Expired => ConnectionState::Lost,
                SessionStatus::Closed => ConnectionState::Closed,
            },
            None => ConnectionState::Lost,
        }
    }

    /// Take the whole service down or bring it back.
    ///
    /// Going down suspends every session; coming back reconnects them.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        if state.available == available {
            return;
        }
        state.available = available;
        tracing::info!(
            "Ensemble {}",
            if available { "available" } else { "unavailable" }
        );

        for record in state.sessions.values() {
            match (record.status, available) {
                (SessionStatus::Active, false) if !record.partitioned => {
                    record.notify(ConnectionState::Suspended)
                }
                (SessionStatus::Active | SessionStatus::Expired, true) if !record.partitioned => {
                    record.notify(ConnectionState::Reconnected)
                }
                _ => {}
            }
        }
    }

    /// Cut a single session off from the service; it stays alive
    pub fn partition(&self, session: SessionId) {
        let mut state = self.lock();
        if let Some(record) = state.sessions.get_mut(&session) {
            if !record.partitioned {
                record.partitioned = true;
                record.notify(ConnectionState::Suspended);
            }
        }
    }

    /// Undo [`partition`](Self::partition)
    pub fn heal(&self, session: SessionId) {
        let mut state = self.lock();
        let available = state.available;
        if let Some(record) = state.sessions.get_mut(&session) {
            if record.partitioned {
                record.partitioned = false;
                if available && record.status != SessionStatus::Closed {
                    record.notify(ConnectionState::Reconnected);
                }
            }
        }
    }

    /// Expire a session as if its owner crashed: its ephemeral nodes are
    /// removed and its client is told the session is lost. A client that can
    /// still reach the service is then told it reconnected.
    pub fn expire_session(&self, session: SessionId) {
        let mut state = self.lock();
        let active = matches!(
            state.sessions.get(&session).map(|r| r.status),
            Some(SessionStatus::Active)
        );
        if !active {
            return;
        }

        let removed = state.remove_ephemerals(session);
        let available = state.available;
        if let Some(record) = state.sessions.get_mut(&session) {
            record.status = SessionStatus::Expired;
            record.notify(ConnectionState::Lost);
            if available && !record.partitioned {
                record.notify(ConnectionState::Reconnected);
            }
        }
        tracing::info!(
            "Expired session {:#x}, removed {} ephemeral nodes",
            session,
            removed
        );
    }

    /// Active sessions
    pub fn sessions(&self) -> Vec<SessionId> {
        let state = self.lock();
        let mut ids: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, r)| r.status == SessionStatus::Active)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Negotiated timeout of a session
    pub fn session_timeout(&self, session: SessionId) -> Option<Duration> {
        self.lock().sessions.get(&session).map(|r| r.timeout)
    }

    /// Direct children of a service-side path, ignoring sessions and ACLs
    pub fn children_of(&self, node_path: &str) -> Vec<String> {
        self.lock().child_names(node_path)
    }

    /// Owner of an ephemeral node at a service-side path
    pub fn ephemeral_owner(&self, node_path: &str) -> Option<SessionId> {
        self.lock()
            .nodes
            .get(node_path)
            .and_then(|n| n.ephemeral_owner)
    }

    pub fn node_exists(&self, node_path: &str) -> bool {
        self.lock().nodes.contains_key(node_path)
    }
}

/// [`CoordinationClient`] bound to a [`MemoryEnsemble`]
pub struct MemoryClient {
    ensemble: Arc<MemoryEnsemble>,
    namespace: String,
    digest: Option<String>,
    session_timeout: Duration,
    retry: ExponentialBackoff,
    session: Mutex<Option<SessionId>>,
    started: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionState>,
}

impl MemoryClient {
    /// Create a client using the namespace, digest, session timeout and retry
    /// policy of `config`
    pub fn new(ensemble: Arc<MemoryEnsemble>, config: &ZkConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ensemble,
            namespace: config.namespace.clone(),
            digest: config.digest().map(str::to_string),
            session_timeout: config.session_timeout(),
            retry: config.retry_policy(),
            session: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        }
    }

    /// Session currently held by this client
    pub fn session_id(&self) -> Option<SessionId> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ensemble(&self) -> &Arc<MemoryEnsemble> {
        &self.ensemble
    }

    fn full_path(&self, node_path: &str) -> String {
        path::apply_namespace(&self.namespace, node_path)
    }

    /// Return a usable session, opening a new one when none is held or the
    /// held one expired
    fn ensure_session(&self) -> Result<SessionId> {
        if self.closed.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let first = session.is_none();
        if let Some(id) = *session {
            match self.ensemble.check_session(id) {
                Ok(()) => return Ok(id),
                Err(ClientError::SessionExpired) => {
                    tracing::info!("Session {:#x} expired, opening a new one", id);
                }
                Err(e) => return Err(e),
            }
        }

        let id = self.ensemble.open_session(
            self.digest.clone(),
            self.session_timeout,
            self.events.clone(),
        )?;
        *session = Some(id);
        if first {
            let _ = self.events.send(ConnectionState::Connected);
        }
        Ok(id)
    }

    async fn with_session<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn(&MemoryEnsemble, SessionId) -> Result<T>,
    {
        let f = &f;
        call_with_retry(&self.retry, operation, move || {
            future::ready(
                self.ensure_session()
                    .and_then(|session| f(&self.ensemble, session)),
            )
        })
        .await
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.ensure_session() {
            Ok(_) => Ok(()),
            Err(e @ ClientError::AuthFailed(_)) => Err(e),
            Err(e) => {
                tracing::warn!("Coordination service not reachable on start: {}", e);
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = session {
            self.ensemble.close_session(id);
        }
        let _ = self.events.send(ConnectionState::Closed);
        Ok(())
    }

    async fn block_until_connected(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                match self.ensure_session() {
                    Ok(_) => return true,
                    Err(ClientError::Closed | ClientError::AuthFailed(_)) => return false,
                    Err(_) => tokio::time::sleep(CONNECT_POLL_INTERVAL).await,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionState::Closed;
        }
        match self.session_id() {
            Some(id) => self.ensemble.session_state(id),
            None => ConnectionState::Suspended,
        }
    }

    async fn create(&self, node_path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let full = self.full_path(node_path);
        let actual = self
            .with_session("create", |ensemble, session| {
                ensemble.create(session, &full, data, mode)
            })
            .await?;
        Ok(path::strip_namespace(&self.namespace, &actual))
    }

    async fn create_containers(&self, node_path: &str) -> Result<()> {
        let full = self.full_path(node_path);
        self.with_session("create_containers", |ensemble, session| {
            if ensemble.exists(session, &full)? {
                return Ok(());
            }
            match ensemble.create(session, &full, &[], CreateMode::Persistent) {
                Ok(_) | Err(ClientError::NodeExists(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn exists(&self, node_path: &str) -> Result<bool> {
        let full = self.full_path(node_path);
        self.with_session("exists", |ensemble, session| ensemble.exists(session, &full))
            .await
    }

    async fn read(&self, node_path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(node_path);
        self.with_session("read", |ensemble, session| ensemble.read(session, &full))
            .await
    }

    async fn write(&self, node_path: &str, data: &[u8]) -> Result<()> {
        let full = self.full_path(node_path);
        self.with_session("write", |ensemble, session| {
            ensemble.write(session, &full, data)
        })
        .await
    }

    async fn delete(&self, node_path: &str) -> Result<()> {
        let full = self.full_path(node_path);
        self.with_session("delete", |ensemble, session| ensemble.delete(session, &full))
            .await
    }

    async fn children(&self, node_path: &str) -> Result<Vec<String>> {
        let full = self.full_path(node_path);
        self.with_session("children", |ensemble, session| {
            ensemble.children(session, &full)
        })
        .await
    }

    async fn watch_children(&self, node_path: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        path::validate(node_path)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(self.ensemble.watch_children(&self.full_path(node_path)))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }
}
