//! Sync coordinator
//!
//! Owns connectivity-state detection and bridges the three timelines the
//! device sees: local user actions, peer-relayed updates, and eventual server
//! replay.
//!
//! ## State machine
//!
//! ```text
//! Offline ──set_online()──► OnlineIdle ──pending + debounce──► Syncing
//!    ▲                           ▲                                │
//!    └────────set_offline()──────┴────────────drain done─────────┘
//! ```
//!
//! Drains are single-flight: a `sync()` while a drain is running is a no-op.
//! Mutations replay in creation order (FIFO per device); failures are marked
//! and retried on the next pass, never dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BackendApi;
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::mesh::{
    ExpenseAction, ExpenseBody, MeshEvent, MeshNode, MeshPayload, SyncBody, WireExpense,
};
use crate::store::Store;
use crate::types::{
    CachedExpense, GroupId, OperationKind, Provenance, QueuedMutation,
};

/// Capacity for the coordinator event broadcast channel
const SYNC_EVENT_CAPACITY: usize = 256;

/// Connectivity-driven coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No server reachability; mutations accumulate in the queue
    Offline,
    /// Server reachable, no drain running
    OnlineIdle,
    /// A drain pass is replaying the queue
    Syncing,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Offline => write!(f, "offline"),
            ConnectivityState::OnlineIdle => write!(f, "online-idle"),
            ConnectivityState::Syncing => write!(f, "syncing"),
        }
    }
}

/// Result of a `sync()` trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A pass ran to completion
    Drained {
        /// Mutations confirmed this pass
        completed: usize,
        /// Mutations that failed and stay queued
        failed: usize,
    },
    /// Another drain was already running; nothing happened
    AlreadyRunning,
    /// The device is offline; nothing happened
    Offline,
}

/// Events emitted by the coordinator
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The connectivity state changed
    StateChanged(ConnectivityState),
    /// A queued mutation was confirmed by the backend
    MutationCompleted(u64),
    /// A queued mutation failed and will be retried next pass
    MutationFailed(u64),
    /// A drain pass finished
    DrainFinished {
        /// Mutations confirmed this pass
        completed: usize,
        /// Mutations that failed this pass
        failed: usize,
    },
    /// A mesh-relayed expense was cached (with provenance) and queued
    ExpenseBridged(CachedExpense),
}

struct CoordinatorInner {
    store: Store,
    mesh: MeshNode,
    backend: Arc<dyn BackendApi>,
    config: MeshConfig,
    state_tx: watch::Sender<ConnectivityState>,
    drain_lock: tokio::sync::Mutex<()>,
    active_group: parking_lot::RwLock<Option<GroupId>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl CoordinatorInner {
    fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectivityState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.event_tx.send(SyncEvent::StateChanged(state));
        }
    }
}

/// Bridges the mesh, the local store, and the backend
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SyncCoordinator {
    /// Wire a coordinator over an existing store, mesh node, and backend.
    ///
    /// Starts in `Offline`; call [`SyncCoordinator::set_online`] when the
    /// host reports connectivity.
    pub fn new(
        store: Store,
        mesh: MeshNode,
        backend: Arc<dyn BackendApi>,
        config: MeshConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::Offline);
        let (event_tx, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                mesh,
                backend,
                config,
                state_tx,
                drain_lock: tokio::sync::Mutex::new(()),
                active_group: parking_lot::RwLock::new(None),
                event_tx,
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start the background loops (connectivity-driven draining, mesh
    /// bridging).
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(Self::drive_loop(inner)));

        let inner = self.inner.clone();
        let events = self.inner.mesh.subscribe();
        tasks.push(tokio::spawn(Self::mesh_loop(inner, events)));
    }

    /// Stop the background loops.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectivityState {
        self.inner.state()
    }

    /// Watch connectivity state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to coordinator events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// The group this device is currently coordinating
    pub fn active_group(&self) -> Option<GroupId> {
        self.inner.active_group.read().clone()
    }

    /// Set the group whose mesh traffic is bridged into the store
    pub fn set_active_group(&self, group: Option<GroupId>) {
        *self.inner.active_group.write() = group;
    }

    /// Mutations not yet confirmed by the backend
    pub fn pending_count(&self) -> MeshResult<usize> {
        self.inner.store.pending_count()
    }

    /// Host connectivity restored.
    pub fn set_online(&self) {
        if self.inner.state() == ConnectivityState::Offline {
            info!("Connectivity restored");
            self.inner.set_state(ConnectivityState::OnlineIdle);
        }
    }

    /// Host connectivity lost.
    ///
    /// An in-flight drain is not cancelled; its results still apply.
    pub fn set_offline(&self) {
        if self.inner.state() != ConnectivityState::Offline {
            info!("Connectivity lost");
            self.inner.set_state(ConnectivityState::Offline);
        }
    }

    /// Author a local mutation: cache it (no provenance), queue it for
    /// replay, and broadcast it to the mesh.
    ///
    /// This is the single fan-out path for expense creation; the enqueue
    /// signals the drain loop, so replay happens opportunistically.
    pub async fn submit_local_expense(&self, expense: CachedExpense) -> MeshResult<QueuedMutation> {
        debug_assert!(expense.provenance.is_none());
        self.inner.store.save_expense(&expense)?;

        let mutation = self.inner.store.enqueue_mutation(QueuedMutation::new(
            OperationKind::Create,
            format!("/groups/{}/expenses", expense.group_id),
            serde_json::to_value(WireExpense::from(&expense))?,
        ))?;

        let payload = MeshPayload::Expense(ExpenseBody {
            action: ExpenseAction::Create,
            expense: WireExpense::from(&expense),
        });
        if let Err(e) = self.inner.mesh.broadcast(payload).await {
            // Peers missing is not an error for the local path; the queue
            // still carries the mutation to the backend
            warn!(error = %e, "Mesh broadcast of local expense failed");
        }

        Ok(mutation)
    }

    /// Ask the mesh for every cached expense of a group (bootstrap after
    /// joining late).
    pub async fn request_group_sync(&self, group: &GroupId) -> MeshResult<()> {
        self.inner
            .mesh
            .broadcast(MeshPayload::Sync(SyncBody {
                group_id: group.as_str().to_string(),
            }))
            .await?;
        Ok(())
    }

    /// Trigger a drain pass now.
    ///
    /// No-op when offline or when a pass is already running (single-flight).
    pub async fn sync(&self) -> MeshResult<SyncOutcome> {
        Self::drain(&self.inner).await
    }

    async fn drain(inner: &Arc<CoordinatorInner>) -> MeshResult<SyncOutcome> {
        if inner.state() == ConnectivityState::Offline {
            return Ok(SyncOutcome::Offline);
        }

        // Single-flight: a second trigger while draining is a no-op
        let _guard = match inner.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Drain already running");
                return Ok(SyncOutcome::AlreadyRunning);
            }
        };

        inner.set_state(ConnectivityState::Syncing);

        let mutations = inner.store.replayable_mutations()?;
        let mut completed = 0;
        let mut failed = 0;

        for mutation in mutations {
            match inner.backend.execute(&mutation).await {
                Ok(()) => {
                    inner.store.mark_completed(mutation.id)?;
                    completed += 1;
                    let _ = inner.event_tx.send(SyncEvent::MutationCompleted(mutation.id));
                }
                Err(MeshError::Auth(reason)) => {
                    // Token refresh already failed inside the backend client;
                    // further attempts this pass would 401 too
                    warn!(id = mutation.id, %reason, "Auth failure, stopping drain");
                    inner.store.mark_failed(mutation.id)?;
                    failed += 1;
                    let _ = inner.event_tx.send(SyncEvent::MutationFailed(mutation.id));
                    break;
                }
                Err(e) => {
                    debug!(id = mutation.id, error = %e, "Replay failed");
                    inner.store.mark_failed(mutation.id)?;
                    failed += 1;
                    let _ = inner.event_tx.send(SyncEvent::MutationFailed(mutation.id));
                }
            }
        }

        let next = if inner.state() == ConnectivityState::Offline {
            ConnectivityState::Offline
        } else {
            ConnectivityState::OnlineIdle
        };
        inner.set_state(next);

        info!(completed, failed, "Drain pass finished");
        let _ = inner.event_tx.send(SyncEvent::DrainFinished { completed, failed });
        Ok(SyncOutcome::Drained { completed, failed })
    }

    /// React to connectivity changes and the store's enqueue signal.
    async fn drive_loop(inner: Arc<CoordinatorInner>) {
        let wake = inner.store.sync_signal();
        let mut state_rx = inner.state_tx.subscribe();

        loop {
            tokio::select! {
                _ = wake.notified() => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if inner.state() != ConnectivityState::OnlineIdle {
                continue;
            }
            match inner.store.pending_count() {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Could not read pending count");
                    continue;
                }
            }

            // Debounce so flapping connectivity does not thrash the queue
            tokio::time::sleep(inner.config.drain_debounce).await;
            if inner.state() == ConnectivityState::Offline {
                continue;
            }

            if let Err(e) = Self::drain(&inner).await {
                warn!(error = %e, "Drain pass errored");
            }
        }
    }

    /// Bridge inbound mesh messages into the store and queue.
    async fn mesh_loop(inner: Arc<CoordinatorInner>, mut events: broadcast::Receiver<MeshEvent>) {
        loop {
            match events.recv().await {
                Ok(MeshEvent::Message(envelope)) => {
                    let result = match &envelope.payload {
                        MeshPayload::Expense(body) => {
                            Self::on_expense(&inner, &envelope.from, envelope.timestamp, body)
                        }
                        MeshPayload::Sync(body) => Self::on_sync_request(&inner, body).await,
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!(from = %envelope.from, error = %e, "Failed to bridge mesh message");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Coordinator lagged behind mesh events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Apply a peer's expense mutation for the active group.
    ///
    /// Creates are cached with provenance AND queued, so this device
    /// independently replays them; the idempotency key lets the backend
    /// collapse the duplicates. Updates and deletes only touch the cache
    /// (last-write-wins by arrival order).
    fn on_expense(
        inner: &CoordinatorInner,
        origin: &crate::types::PeerId,
        timestamp: i64,
        body: &ExpenseBody,
    ) -> MeshResult<()> {
        let group = GroupId::new(body.expense.group_id.clone());
        let active = inner.active_group.read().clone();
        if active.as_ref() != Some(&group) {
            debug!(group = %group, "Ignoring expense for inactive group");
            return Ok(());
        }

        match body.action {
            ExpenseAction::Create => {
                let cached = body.expense.clone().into_cached(Some(Provenance {
                    origin_peer: origin.clone(),
                    origin_timestamp: timestamp,
                }));
                inner.store.save_expense(&cached)?;

                inner.store.enqueue_mutation(QueuedMutation::new(
                    OperationKind::Create,
                    format!("/groups/{}/expenses", group),
                    serde_json::to_value(&body.expense)?,
                ))?;

                info!(expense = %cached.id, origin = %origin, "Bridged mesh expense");
                let _ = inner.event_tx.send(SyncEvent::ExpenseBridged(cached));
            }
            ExpenseAction::Update => {
                let cached = body.expense.clone().into_cached(Some(Provenance {
                    origin_peer: origin.clone(),
                    origin_timestamp: timestamp,
                }));
                inner.store.save_expense(&cached)?;
            }
            ExpenseAction::Delete => {
                inner
                    .store
                    .delete_expense(&crate::types::ExpenseId::new(body.expense.id.clone()))?;
            }
        }
        Ok(())
    }

    /// Answer a sync request by re-broadcasting every cached expense of the
    /// active group, so a newly joined peer bootstraps from whoever answers
    /// first.
    async fn on_sync_request(inner: &Arc<CoordinatorInner>, body: &SyncBody) -> MeshResult<()> {
        let group = GroupId::new(body.group_id.clone());
        let active = inner.active_group.read().clone();
        if active.as_ref() != Some(&group) {
            return Ok(());
        }

        let expenses = inner.store.expenses_for_group(&group)?;
        info!(group = %group, count = expenses.len(), "Answering sync request");
        for expense in &expenses {
            let payload = MeshPayload::Expense(ExpenseBody {
                action: ExpenseAction::Create,
                expense: WireExpense::from(expense),
            });
            if let Err(e) = inner.mesh.broadcast(payload).await {
                warn!(error = %e, "Failed to answer sync request");
                break;
            }
        }
        Ok(())
    }
}
