//! Mesh node: broadcast, relay, and peer liveness
//!
//! One `MeshNode` per device. It owns the active peer set (it is the only
//! writer of peer status), stamps outgoing envelopes, deduplicates inbound
//! ones by `(from, timestamp)`, forwards addressed envelopes one hop, and
//! fans delivered messages out to subscribers on a broadcast channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MeshNode                                                       │
//! │  ├── transport events ──► peer table (status, last_seen)        │
//! │  │                        └── health sweep evicts silent peers  │
//! │  ├── inbound frames ────► dedup ─► relay (addressed) ─► deliver │
//! │  │                                  │                           │
//! │  │                                  └── self-filter             │
//! │  └── broadcast()/send_to() ─► stamp from+timestamp ─► channels  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::envelope::{MeshEnvelope, MeshPayload, MessageKey, PingBody};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::transport::{Transport, TransportEvent};
use crate::types::{PeerId, PeerRecord, PeerStatus};

/// Capacity for the mesh event broadcast channel
const MESH_EVENT_CAPACITY: usize = 256;

/// Events emitted by the mesh layer
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A unique inbound message addressed to us or broadcast.
    ///
    /// Delivered at most once per `(from, timestamp)`; never our own.
    Message(MeshEnvelope),
    /// A nearby device was found
    PeerDiscovered {
        /// The device
        peer: PeerId,
        /// Announced name, possibly empty until the first ping
        display_name: String,
    },
    /// A channel to the peer is open
    PeerConnected(PeerId),
    /// The peer left the active set (channel loss or liveness eviction)
    PeerDisconnected(PeerId),
}

/// Bounded set of already-delivered message identities.
///
/// FIFO eviction; capacity bounds memory on long-lived meshes.
struct SeenSet {
    set: HashSet<MessageKey>,
    order: VecDeque<MessageKey>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record a key; returns false if it was already present.
    fn insert(&mut self, key: MessageKey) -> bool {
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct NodeInner {
    local: PeerId,
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    seen: Mutex<SeenSet>,
    last_stamp: Mutex<i64>,
    event_tx: broadcast::Sender<MeshEvent>,
}

/// Handle to this device's mesh layer
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MeshNode {
    /// Create a mesh node over the given transport.
    ///
    /// Call [`MeshNode::start`] to begin processing traffic.
    pub fn new(transport: Arc<dyn Transport>, config: MeshConfig) -> Self {
        let (event_tx, _) = broadcast::channel(MESH_EVENT_CAPACITY);
        let seen_capacity = config.seen_capacity;
        Self {
            inner: Arc::new(NodeInner {
                local: transport.local_peer(),
                config,
                transport,
                peers: RwLock::new(HashMap::new()),
                seen: Mutex::new(SeenSet::new(seen_capacity)),
                last_stamp: Mutex::new(0),
                event_tx,
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// This device's peer id
    pub fn local_peer(&self) -> PeerId {
        self.inner.local.clone()
    }

    /// Subscribe to mesh events.
    ///
    /// Multiple subscribers can exist; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Snapshot of the active peer set
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.peers.read().values().cloned().collect()
    }

    /// Peers with a live channel right now
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .peers
            .read()
            .values()
            .filter(|r| r.status == PeerStatus::Connected)
            .map(|r| r.peer_id.clone())
            .collect()
    }

    /// Start discovery and the background loops (events, liveness, keepalive).
    ///
    /// Propagates `RadioUnavailable` from the transport so the caller can
    /// disable mesh features.
    pub async fn start(&self) -> MeshResult<()> {
        self.inner.transport.start_discovery().await?;

        let mut tasks = self.tasks.lock();

        let inner = self.inner.clone();
        let events = self.inner.transport.events();
        tasks.push(tokio::spawn(Self::event_loop(inner, events)));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(Self::sweep_loop(inner)));

        let node = self.clone();
        tasks.push(tokio::spawn(Self::ping_loop(node)));

        info!(peer = %self.inner.local, "Mesh node started");
        Ok(())
    }

    /// Stop background loops and close every channel.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.inner.transport.disconnect_all().await;
    }

    /// Dial a discovered peer.
    ///
    /// Connection errors are returned to the caller (user-triggered retry
    /// only, never automatic).
    pub async fn connect(&self, peer: &PeerId) -> MeshResult<()> {
        {
            let mut peers = self.inner.peers.write();
            peers
                .entry(peer.clone())
                .or_insert_with(|| PeerRecord::new(peer.clone(), ""))
                .status = PeerStatus::Connecting;
        }
        self.inner.transport.connect(peer).await
    }

    /// Broadcast a payload to every connected peer.
    ///
    /// Stamps `from` and a strictly increasing `timestamp`, making the
    /// envelope's `(from, timestamp)` a usable identity. Returns the stamped
    /// envelope. Per-peer send failures drop that peer from the active set
    /// but do not fail the broadcast.
    pub async fn broadcast(&self, payload: MeshPayload) -> MeshResult<MeshEnvelope> {
        let envelope = self.stamp(payload, None);
        self.dispatch(&envelope).await?;
        Ok(envelope)
    }

    /// Send a payload to one peer, relayed by neighbors when not directly
    /// connected.
    pub async fn send_to(&self, peer: &PeerId, payload: MeshPayload) -> MeshResult<MeshEnvelope> {
        let envelope = self.stamp(payload, Some(peer.clone()));
        self.dispatch(&envelope).await?;
        Ok(envelope)
    }

    fn stamp(&self, payload: MeshPayload, to: Option<PeerId>) -> MeshEnvelope {
        let timestamp = {
            let mut last = self.inner.last_stamp.lock();
            let now = chrono::Utc::now().timestamp_millis();
            let stamp = now.max(*last + 1);
            *last = stamp;
            stamp
        };
        let envelope = MeshEnvelope {
            from: self.inner.local.clone(),
            to,
            timestamp,
            payload,
        };
        // Our own envelopes count as seen so relayed echoes are ignored
        self.inner.seen.lock().insert(envelope.dedup_key());
        envelope
    }

    async fn dispatch(&self, envelope: &MeshEnvelope) -> MeshResult<()> {
        let frame = Bytes::from(envelope.encode()?);

        // Addressed envelope with a direct channel: send straight there
        if let Some(target) = &envelope.to {
            let direct = self.inner.peers.read().get(target).map(|r| r.status)
                == Some(PeerStatus::Connected);
            if direct {
                return match self.inner.transport.send(target, frame).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.drop_peer(target);
                        Err(e)
                    }
                };
            }
        }

        // Broadcast (or store-and-forward via every neighbor)
        let connected = self.connected_peers();
        if connected.is_empty() {
            if envelope.to.is_some() {
                return Err(MeshError::ChannelClosed("no connected peers".to_string()));
            }
            return Ok(());
        }
        for peer in connected {
            if let Err(e) = self.inner.transport.send(&peer, frame.clone()).await {
                warn!(peer = %peer, error = %e, "Send failed, dropping peer");
                self.drop_peer(&peer);
            }
        }
        Ok(())
    }

    fn drop_peer(&self, peer: &PeerId) {
        if self.inner.peers.write().remove(peer).is_some() {
            let _ = self
                .inner
                .event_tx
                .send(MeshEvent::PeerDisconnected(peer.clone()));
        }
    }

    async fn event_loop(inner: Arc<NodeInner>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Discovered { peer, display_name }) => {
                    Self::on_discovered(&inner, peer, display_name);
                }
                Ok(TransportEvent::Connected(peer)) => {
                    Self::on_connected(&inner, peer);
                }
                Ok(TransportEvent::Disconnected(peer)) => {
                    if inner.peers.write().remove(&peer).is_some() {
                        let _ = inner.event_tx.send(MeshEvent::PeerDisconnected(peer));
                    }
                }
                Ok(TransportEvent::Message { from, frame }) => {
                    Self::on_frame(&inner, from, frame).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Mesh event loop lagged behind transport");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Transport event channel closed");
                    break;
                }
            }
        }
    }

    fn on_discovered(inner: &NodeInner, peer: PeerId, display_name: String) {
        {
            let mut peers = inner.peers.write();
            let record = peers
                .entry(peer.clone())
                .or_insert_with(|| PeerRecord::new(peer.clone(), display_name.clone()));
            if !display_name.is_empty() {
                record.display_name = display_name.clone();
            }
        }
        let _ = inner
            .event_tx
            .send(MeshEvent::PeerDiscovered { peer, display_name });
    }

    fn on_connected(inner: &NodeInner, peer: PeerId) {
        {
            let mut peers = inner.peers.write();
            let record = peers
                .entry(peer.clone())
                .or_insert_with(|| PeerRecord::new(peer.clone(), ""));
            record.status = PeerStatus::Connected;
            record.touch();
        }
        let _ = inner.event_tx.send(MeshEvent::PeerConnected(peer));
    }

    async fn on_frame(inner: &Arc<NodeInner>, link_from: PeerId, frame: Bytes) {
        let envelope = match MeshEnvelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %link_from, error = %e, "Dropping malformed envelope");
                return;
            }
        };

        // Any traffic counts as liveness for the link peer; a first inbound
        // message creates the record
        {
            let mut peers = inner.peers.write();
            let record = peers
                .entry(link_from.clone())
                .or_insert_with(|| PeerRecord::new(link_from.clone(), ""));
            record.status = PeerStatus::Connected;
            record.touch();
        }

        // Pings carry the origin's display name
        if let MeshPayload::Ping(ping) = &envelope.payload {
            if envelope.from == link_from && !ping.display_name.is_empty() {
                if let Some(record) = inner.peers.write().get_mut(&link_from) {
                    record.display_name = ping.display_name.clone();
                }
            }
        }

        // Exactly-once delivery per (from, timestamp); also breaks relay loops
        if !inner.seen.lock().insert(envelope.dedup_key()) {
            debug!(from = %envelope.from, ts = envelope.timestamp, "Duplicate envelope ignored");
            return;
        }

        // Addressed to someone else: forward unmodified one hop, never deliver
        if let Some(target) = &envelope.to {
            if *target != inner.local {
                Self::relay(inner, target, &frame).await;
                return;
            }
        }

        // Never re-process our own broadcast
        if envelope.from == inner.local {
            return;
        }

        let _ = inner.event_tx.send(MeshEvent::Message(envelope));
    }

    /// Store-and-forward: single retry, no acknowledgment.
    async fn relay(inner: &Arc<NodeInner>, target: &PeerId, frame: &Bytes) {
        let connected = inner.peers.read().get(target).map(|r| r.status)
            == Some(PeerStatus::Connected);
        if !connected {
            debug!(target = %target, "Relay target not connected, dropping");
            return;
        }

        for attempt in 0..2 {
            match inner.transport.send(target, frame.clone()).await {
                Ok(()) => {
                    debug!(target = %target, "Relayed envelope");
                    return;
                }
                Err(e) if attempt == 0 => {
                    debug!(target = %target, error = %e, "Relay failed, retrying once");
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "Relay failed");
                }
            }
        }
    }

    async fn sweep_loop(inner: Arc<NodeInner>) {
        let mut interval = tokio::time::interval(inner.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let overdue: Vec<PeerId> = inner
                .peers
                .read()
                .values()
                .filter(|r| r.idle_for() > inner.config.peer_timeout)
                .map(|r| r.peer_id.clone())
                .collect();

            for peer in overdue {
                info!(peer = %peer, "Evicting silent peer");
                if inner.peers.write().remove(&peer).is_some() {
                    let _ = inner.event_tx.send(MeshEvent::PeerDisconnected(peer.clone()));
                }
                let _ = inner.transport.disconnect(&peer).await;
            }
        }
    }

    async fn ping_loop(node: MeshNode) {
        let mut interval = tokio::time::interval(node.inner.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if node.connected_peers().is_empty() {
                continue;
            }
            let ping = MeshPayload::Ping(PingBody {
                display_name: node.inner.config.display_name.clone(),
            });
            if let Err(e) = node.broadcast(ping).await {
                debug!(error = %e, "Keepalive broadcast failed");
            }
        }
    }
}
