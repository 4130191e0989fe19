//! Application-facing engine
//!
//! `MeshEngine` is the context object owned by the application root: it wires
//! the store, transport, mesh node, and sync coordinator together and exposes
//! the operations the chat and expense flows call. Everything downstream
//! receives injected handles; there are no module-level singletons.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::backend::BackendApi;
use crate::config::MeshConfig;
use crate::coordinator::{ConnectivityState, SyncCoordinator, SyncEvent, SyncOutcome};
use crate::error::MeshResult;
use crate::mesh::{ChatBody, MeshEvent, MeshNode, MeshPayload};
use crate::store::Store;
use crate::transport::{IrohTransport, Transport};
use crate::types::{
    CachedExpense, ExpenseSplit, GroupId, MemberId, PeerId, PeerRecord, TripPackage,
};

/// Snapshot of this device's mesh/sync state, for UI and CLI display
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// This device's stable peer id
    pub peer_id: PeerId,
    /// Name announced to peers
    pub display_name: String,
    /// Current connectivity state
    pub state: ConnectivityState,
    /// Mutations not yet confirmed by the backend
    pub pending_mutations: usize,
    /// Peers with a live channel
    pub connected_peers: usize,
}

/// The application root's handle to the whole subsystem
pub struct MeshEngine {
    store: Store,
    mesh: MeshNode,
    coordinator: SyncCoordinator,
    config: MeshConfig,
}

impl MeshEngine {
    /// Wire an engine over an explicit transport and backend.
    ///
    /// The store lives at `<data_dir>/tripmesh.redb`.
    pub fn new(
        data_dir: impl AsRef<Path>,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn BackendApi>,
    ) -> MeshResult<Self> {
        let store = Store::open(data_dir.as_ref().join("tripmesh.redb"))?;
        Self::with_store(store, config, transport, backend)
    }

    /// Wire an engine over an already-open store.
    pub fn with_store(
        store: Store,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn BackendApi>,
    ) -> MeshResult<Self> {
        let mesh = MeshNode::new(transport, config.clone());
        let coordinator =
            SyncCoordinator::new(store.clone(), mesh.clone(), backend, config.clone());

        Ok(Self {
            store,
            mesh,
            coordinator,
            config,
        })
    }

    /// Wire an engine over the production iroh transport.
    ///
    /// Loads the persisted endpoint secret key (or generates and persists
    /// one) so the device's peer id is stable across restarts.
    pub async fn with_iroh(
        data_dir: impl AsRef<Path>,
        config: MeshConfig,
        backend: Arc<dyn BackendApi>,
    ) -> MeshResult<Self> {
        let store = Store::open(data_dir.as_ref().join("tripmesh.redb"))?;

        let secret_key = match store.load_endpoint_secret_key()? {
            Some(key_bytes) => {
                info!("Loaded persistent endpoint secret key");
                iroh::SecretKey::from(key_bytes)
            }
            None => {
                let secret_key = iroh::SecretKey::generate(&mut rand::rng());
                let key_bytes: [u8; 32] = secret_key.to_bytes();
                store.save_endpoint_secret_key(&key_bytes)?;
                info!("Generated new endpoint secret key");
                secret_key
            }
        };

        let transport = Arc::new(IrohTransport::bind(Some(secret_key)).await?);
        Self::with_store(store, config, transport, backend)
    }

    /// Start discovery and all background loops.
    ///
    /// Propagates `RadioUnavailable`; the caller should then run with mesh
    /// features disabled rather than retry.
    pub async fn start(&self) -> MeshResult<()> {
        self.mesh.start().await?;
        self.coordinator.start();
        Ok(())
    }

    /// Stop background loops and close peer channels.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown();
        self.mesh.shutdown().await;
    }

    // ───────────────────────────────────────────────────────────────────────
    // Identity and peers
    // ───────────────────────────────────────────────────────────────────────

    /// This device's peer id
    pub fn local_peer(&self) -> PeerId {
        self.mesh.local_peer()
    }

    /// Snapshot of the active peer set
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.mesh.peers()
    }

    /// Dial a discovered peer (user-triggered; errors are surfaced, not
    /// retried automatically)
    pub async fn connect_peer(&self, peer: &PeerId) -> MeshResult<()> {
        self.mesh.connect(peer).await
    }

    /// Current node state for display
    pub fn info(&self) -> MeshResult<NodeInfo> {
        Ok(NodeInfo {
            peer_id: self.local_peer(),
            display_name: self.config.display_name.clone(),
            state: self.coordinator.state(),
            pending_mutations: self.coordinator.pending_count()?,
            connected_peers: self.mesh.connected_peers().len(),
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Application operations
    // ───────────────────────────────────────────────────────────────────────

    /// Broadcast a chat line to the group channel.
    pub async fn send_chat(&self, text: impl Into<String>) -> MeshResult<()> {
        self.mesh
            .broadcast(MeshPayload::Chat(ChatBody {
                text: text.into(),
                author: self.config.display_name.clone(),
            }))
            .await?;
        Ok(())
    }

    /// Create an expense locally: cache, queue for replay, broadcast to
    /// peers, and drain opportunistically.
    pub async fn create_expense(
        &self,
        group_id: GroupId,
        description: impl Into<String>,
        amount: i64,
        paid_by: MemberId,
        split: Vec<ExpenseSplit>,
    ) -> MeshResult<CachedExpense> {
        let expense = CachedExpense::new(group_id, description, amount, paid_by, split);
        self.coordinator.submit_local_expense(expense.clone()).await?;
        Ok(expense)
    }

    /// Ask the mesh for every cached expense of a group
    pub async fn request_group_sync(&self, group: &GroupId) -> MeshResult<()> {
        self.coordinator.request_group_sync(group).await
    }

    /// Set the group whose mesh traffic is bridged into the store
    pub fn set_active_group(&self, group: Option<GroupId>) {
        self.coordinator.set_active_group(group);
    }

    /// Full offline snapshot of a trip, rebuilt when stale
    pub fn trip_package(&self, group: &GroupId) -> MeshResult<TripPackage> {
        self.store.trip_package(group, self.config.package_staleness)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Connectivity and sync
    // ───────────────────────────────────────────────────────────────────────

    /// Host reports server connectivity restored
    pub fn set_online(&self) {
        self.coordinator.set_online();
    }

    /// Host reports server connectivity lost
    pub fn set_offline(&self) {
        self.coordinator.set_offline();
    }

    /// Trigger a drain pass now (single-flight)
    pub async fn sync_now(&self) -> MeshResult<SyncOutcome> {
        self.coordinator.sync().await
    }

    /// Mutations not yet confirmed by the backend ("N changes pending")
    pub fn pending_count(&self) -> MeshResult<usize> {
        self.coordinator.pending_count()
    }

    /// Subscribe to mesh events (messages, peer lifecycle)
    pub fn subscribe_mesh(&self) -> broadcast::Receiver<MeshEvent> {
        self.mesh.subscribe()
    }

    /// Subscribe to coordinator events (state, replay progress)
    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    /// Watch connectivity state
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.coordinator.watch_state()
    }

    /// Direct access to the local store (read paths, maintenance)
    pub fn store(&self) -> &Store {
        &self.store
    }
}
