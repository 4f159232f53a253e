//! Election engine
//!
//! Owns the participant's latch and turns its leadership edges, together
//! with the periodic reconciliation, into role transitions and handler
//! calls. Edges and reconciliation assertions are consumed by one dispatch
//! task, so the role context and handlers never see two updates at once.

use crate::error::ElectionError;
use crate::handler::{Handlers, LeaderHandler, StandByHandler};
use crate::identity;
use crate::latch::{LatchEvent, LeaderLatch};
use crate::reconcile::{Assertion, LeadershipView, Reconciler, RECONCILE_INTERVAL};
use crate::role::{Role, RoleContext, RoleSnapshot};
use ffzk_client::{CoordinationClient, ZkConfig};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

struct Running {
    latch: Option<Arc<LeaderLatch>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ElectionEngine {
    client: Arc<dyn CoordinationClient>,
    latch_path: String,
    participant_id: String,
    role: Arc<RoleContext>,
    handlers: Handlers,
    reconciler: Reconciler,
    running: Mutex<Option<Running>>,
    latch: RwLock<Option<Arc<LeaderLatch>>>,
}

impl ElectionEngine {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        latch_path: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Self {
        let role = Arc::new(RoleContext::new());
        Self {
            client,
            latch_path: latch_path.into(),
            participant_id: participant_id.into(),
            reconciler: Reconciler::new(role.clone()),
            role,
            handlers: Handlers::default(),
            running: Mutex::new(None),
            latch: RwLock::new(None),
        }
    }

    /// Build an engine from configuration, or `None` when election is
    /// disabled
    pub fn from_config(client: Arc<dyn CoordinationClient>, config: &ZkConfig) -> Option<Self> {
        if !config.election.enable {
            tracing::info!("Leader election is disabled");
            return None;
        }
        let id = identity::participant_id(config.application_name.as_deref());
        Some(Self::new(client, config.lead_latch_path.clone(), id))
    }

    pub fn with_leader_handler(mut self, handler: Arc<dyn LeaderHandler>) -> Self {
        self.handlers.leader = Some(handler);
        self
    }

    pub fn with_standby_handler(mut self, handler: Arc<dyn StandByHandler>) -> Self {
        self.handlers.standby = Some(handler);
        self
    }

    /// Join the election and start reconciliation.
    ///
    /// Never fails: problems are logged and the engine keeps running as a
    /// non-participating follower. Calling it while running is a no-op.
    pub async fn init(&self) {
        let mut running = self.running.lock().await;
        self.start_locked(&mut running).await;
    }

    /// Leave the election. No handler is invoked after this returns.
    ///
    /// Await this before dropping the engine: dropping a running engine only
    /// stops its tasks and leaves the participant node registered until the
    /// session ends.
    pub async fn close(&self) {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await;
    }

    /// Leave and rejoin with a fresh participant node
    pub async fn reelection(&self) {
        let mut running = self.running.lock().await;
        tracing::info!("Participant {} requested reelection", self.participant_id);
        self.stop_locked(&mut running).await;
        self.start_locked(&mut running).await;
    }

    pub fn is_leader(&self) -> bool {
        self.current_latch()
            .map(|latch| latch.has_leadership())
            .unwrap_or(false)
    }

    /// Id of the current leader, `None` when it cannot be determined
    pub fn current_leader_id(&self) -> Option<String> {
        let result = match self.current_latch() {
            Some(latch) => latch.current_leader_id(),
            None => Err(ElectionError::leader_query_failed("not participating")),
        };
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Get leader id failed: {}", e);
                None
            }
        }
    }

    pub fn role(&self) -> RoleSnapshot {
        self.role.snapshot()
    }

    pub fn role_context(&self) -> Arc<RoleContext> {
        self.role.clone()
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn latch_path(&self) -> &str {
        &self.latch_path
    }

    fn current_latch(&self) -> Option<Arc<LeaderLatch>> {
        self.latch
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_latch(&self, latch: Option<Arc<LeaderLatch>>) {
        *self.latch.write().unwrap_or_else(PoisonError::into_inner) = latch;
    }

    async fn ensure_latch_path(&self) {
        let result = match self.client.exists(&self.latch_path).await {
            Ok(true) => return,
            Ok(false) => self.client.create_containers(&self.latch_path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let error = ElectionError::path_creation_failed(&self.latch_path, e);
            tracing::error!("{}", error);
        }
    }

    async fn start_locked(&self, running: &mut Option<Running>) {
        if running.is_some() {
            tracing::warn!("Election engine is already running");
            return;
        }

        self.ensure_latch_path().await;
        if self.handlers.leader.is_none() {
            tracing::warn!("No leader handler registered");
        }
        if self.handlers.standby.is_none() {
            tracing::warn!("No standby handler registered");
        }

        let (edge_tx, edge_rx) = mpsc::unbounded_channel();
        let latch = match LeaderLatch::start(
            self.client.clone(),
            &self.latch_path,
            &self.participant_id,
            edge_tx,
        )
        .await
        {
            Ok(latch) => Some(latch),
            Err(e) => {
                tracing::error!(
                    "Participant {} failed to join election: {}",
                    self.participant_id,
                    e
                );
                None
            }
        };
        self.set_latch(latch.clone());

        let cancel = CancellationToken::new();
        let (assert_tx, assert_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            role: self.role.clone(),
            handlers: self.handlers.clone(),
            reconciler: self.reconciler.clone(),
            latch: latch.clone(),
            follower_confirmed: false,
        };

        let mut tasks = vec![tokio::spawn(dispatch_loop(
            dispatcher,
            edge_rx,
            assert_rx,
            cancel.clone(),
        ))];
        if let Some(latch) = &latch {
            tasks.push(tokio::spawn(reconcile_loop(
                self.reconciler.clone(),
                latch.clone(),
                assert_tx,
                cancel.clone(),
            )));
        }

        tracing::info!(
            "Election engine started for {} under {}",
            self.participant_id,
            self.latch_path
        );
        *running = Some(Running {
            latch,
            cancel,
            tasks,
        });
    }

    async fn stop_locked(&self, running: &mut Option<Running>) {
        let Some(stopped) = running.take() else {
            return;
        };

        stopped.cancel.cancel();
        for task in stopped.tasks {
            if let Err(e) = task.await {
                tracing::error!("Election task ended abnormally: {}", e);
            }
        }
        if let Some(latch) = stopped.latch {
            latch.close().await;
        }
        self.set_latch(None);
        self.reconciler.reset();
        tracing::info!("Election engine stopped for {}", self.participant_id);
    }
}

impl Drop for ElectionEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            tracing::warn!(
                "Election engine for {} dropped while running, its node stays registered until the session ends",
                self.participant_id
            );
            running.cancel.cancel();
        }
    }
}

struct Dispatcher {
    role: Arc<RoleContext>,
    handlers: Handlers,
    reconciler: Reconciler,
    latch: Option<Arc<LeaderLatch>>,
    /// Set once follower state was announced since this start
    follower_confirmed: bool,
}

impl Dispatcher {
    async fn on_edge(&mut self, event: LatchEvent) {
        match event {
            LatchEvent::LeaderAcquired => {
                let replaced = self.role.transition(Role::Leader);
                tracing::info!("Role changed from {} to leader", describe(replaced));
                self.handlers.on_leader().await;
            }
            LatchEvent::LeaderLost => {
                self.follower_confirmed = true;
                // a reconciliation assertion may already have demoted us
                match self
                    .role
                    .transition_if(Role::Follower, |s| s.current != Some(Role::Follower))
                {
                    Some(replaced) => {
                        tracing::info!("Role changed from {} to follower", describe(replaced));
                        self.handlers.on_standby().await;
                    }
                    None => tracing::debug!("Follower state already recorded, skipping LeaderLost"),
                }
            }
        }
    }

    async fn on_assertion(&mut self, assertion: Assertion) {
        let Some(latch) = &self.latch else {
            return;
        };
        if assertion == Assertion::Initial && self.follower_confirmed {
            tracing::debug!("Follower state already announced, dropping {:?}", assertion);
            return;
        }
        let view: &dyn LeadershipView = latch.as_ref();
        match self.reconciler.apply(assertion, view) {
            Some(replaced) => {
                self.follower_confirmed = true;
                tracing::info!(
                    "Reconciliation ({:?}) moved role from {} to follower",
                    assertion,
                    describe(replaced)
                );
                self.handlers.on_standby().await;
            }
            None => tracing::debug!("Dropped stale {:?} assertion", assertion),
        }
    }
}

fn describe(snapshot: RoleSnapshot) -> String {
    snapshot
        .current
        .map_or_else(|| "none".to_string(), |role| role.to_string())
}

async fn dispatch_loop(
    mut dispatcher: Dispatcher,
    mut edges: mpsc::UnboundedReceiver<LatchEvent>,
    mut assertions: mpsc::UnboundedReceiver<Assertion>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = edges.recv() => dispatcher.on_edge(event).await,
            Some(assertion) = assertions.recv() => dispatcher.on_assertion(assertion).await,
            else => break,
        }
    }
}

async fn reconcile_loop(
    reconciler: Reconciler,
    latch: Arc<LeaderLatch>,
    assertions: mpsc::UnboundedSender<Assertion>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Some(assertion) = reconciler.tick(latch.as_ref()) {
                    if assertions.send(assertion).is_err() {
                        break;
                    }
                }
            }
        }
    }
}
