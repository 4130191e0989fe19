//! In-process transport for tests and simulation
//!
//! A [`MemoryHub`] stands in for the radio environment: transports register
//! with it, and an explicit link table decides who can talk to whom. Tests
//! shape the topology directly (`link`, `unlink`) to reproduce partial
//! connectivity - e.g. A-B and B-C linked but A-C not, the relay scenario.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Transport, TransportEvent, TRANSPORT_EVENT_CAPACITY};
use crate::error::{MeshError, MeshResult};
use crate::types::PeerId;

struct HubPeer {
    display_name: String,
    event_tx: broadcast::Sender<TransportEvent>,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<PeerId, HubPeer>,
    links: HashSet<(PeerId, PeerId)>,
}

impl HubInner {
    fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.contains(&Self::link_key(a, b))
    }

    fn emit(&self, peer: &PeerId, event: TransportEvent) {
        if let Some(entry) = self.peers.get(peer) {
            let _ = entry.event_tx.send(event);
        }
    }
}

/// The shared in-process "radio environment"
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and hand back its transport
    pub fn register(&self, peer_id: PeerId, display_name: impl Into<String>) -> MemoryTransport {
        let (event_tx, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);
        let mut inner = self.inner.lock();
        inner.peers.insert(
            peer_id.clone(),
            HubPeer {
                display_name: display_name.into(),
                event_tx: event_tx.clone(),
            },
        );
        MemoryTransport {
            hub: self.clone(),
            local: peer_id,
            event_tx,
        }
    }

    /// Open the channel between two registered devices, notifying both
    pub fn link(&self, a: &PeerId, b: &PeerId) {
        let inner = &mut *self.inner.lock();
        if inner.links.insert(HubInner::link_key(a, b)) {
            inner.emit(a, TransportEvent::Connected(b.clone()));
            inner.emit(b, TransportEvent::Connected(a.clone()));
        }
    }

    /// Drop the channel between two devices, notifying both
    pub fn unlink(&self, a: &PeerId, b: &PeerId) {
        let inner = &mut *self.inner.lock();
        if inner.links.remove(&HubInner::link_key(a, b)) {
            inner.emit(a, TransportEvent::Disconnected(b.clone()));
            inner.emit(b, TransportEvent::Disconnected(a.clone()));
        }
    }

    fn announce(&self, from: &PeerId) {
        let inner = self.inner.lock();
        let from_name = match inner.peers.get(from) {
            Some(p) => p.display_name.clone(),
            None => return,
        };
        for (other_id, other) in &inner.peers {
            if other_id == from {
                continue;
            }
            // Both sides learn about each other
            let _ = other.event_tx.send(TransportEvent::Discovered {
                peer: from.clone(),
                display_name: from_name.clone(),
            });
            inner.emit(
                from,
                TransportEvent::Discovered {
                    peer: other_id.clone(),
                    display_name: other.display_name.clone(),
                },
            );
        }
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, frame: Bytes) -> MeshResult<()> {
        let inner = self.inner.lock();
        if !inner.linked(from, to) {
            return Err(MeshError::ChannelClosed(to.to_string()));
        }
        match inner.peers.get(to) {
            Some(entry) => {
                let _ = entry.event_tx.send(TransportEvent::Message {
                    from: from.clone(),
                    frame,
                });
                Ok(())
            }
            None => Err(MeshError::ChannelClosed(to.to_string())),
        }
    }

    fn drop_peer_links(&self, peer: &PeerId) {
        let inner = &mut *self.inner.lock();
        let affected: Vec<(PeerId, PeerId)> = inner
            .links
            .iter()
            .filter(|(a, b)| a == peer || b == peer)
            .cloned()
            .collect();
        for key in affected {
            inner.links.remove(&key);
            let other = if key.0 == *peer { key.1 } else { key.0 };
            inner.emit(peer, TransportEvent::Disconnected(other.clone()));
            inner.emit(&other, TransportEvent::Disconnected(peer.clone()));
        }
    }
}

/// One device's view of the [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    local: PeerId,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl MemoryTransport {
    /// The hub this transport is registered with
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn start_discovery(&self) -> MeshResult<()> {
        self.hub.announce(&self.local);
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> MeshResult<()> {
        let known = self.hub.inner.lock().peers.contains_key(peer);
        if !known {
            return Err(MeshError::ConnectionTimeout(peer.to_string()));
        }
        self.hub.link(&self.local, peer);
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: Bytes) -> MeshResult<()> {
        self.hub.deliver(&self.local, peer, frame)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn disconnect(&self, peer: &PeerId) -> MeshResult<()> {
        self.hub.unlink(&self.local, peer);
        Ok(())
    }

    async fn disconnect_all(&self) -> MeshResult<()> {
        self.hub.drop_peer_links(&self.local);
        Ok(())
    }
}
