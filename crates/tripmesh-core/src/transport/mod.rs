//! Peer transport layer
//!
//! Discovers nearby devices, negotiates one bidirectional message channel per
//! peer, and surfaces connect/disconnect/message events. Two implementations:
//!
//! - [`IrohTransport`]: QUIC peer channels over an iroh endpoint with a
//!   dedicated mesh ALPN; the production transport.
//! - [`MemoryHub`]/[`MemoryTransport`]: in-process hub with an explicit link
//!   topology; drives integration tests and simulations.
//!
//! The transport reports raw link traffic only. Peer records, liveness, and
//! relay semantics live one layer up in [`crate::mesh`], which is the single
//! writer of peer status.

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::MeshResult;
use crate::types::PeerId;

pub mod iroh;
pub mod memory;

pub use self::iroh::IrohTransport;
pub use memory::{MemoryHub, MemoryTransport};

/// Capacity for transport event broadcast channels
pub(crate) const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// Link-level events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A nearby device was found (not yet connected)
    Discovered {
        /// The device's stable peer id
        peer: PeerId,
        /// Name announced by the device, if any
        display_name: String,
    },
    /// A bidirectional channel to the peer is open
    Connected(PeerId),
    /// The channel to the peer is gone
    Disconnected(PeerId),
    /// One message frame arrived from a directly connected peer
    Message {
        /// The link-level sender (not necessarily the envelope origin)
        from: PeerId,
        /// The raw frame
        frame: Bytes,
    },
}

/// A short-range peer transport.
///
/// Implementations are injected into the mesh node; nothing in the crate
/// assumes a concrete transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// This device's stable peer id
    fn local_peer(&self) -> PeerId;

    /// Begin announcing/browsing for nearby devices.
    ///
    /// Found devices surface as [`TransportEvent::Discovered`]. Fails with
    /// `RadioUnavailable` when the host has no usable short-range interface.
    async fn start_discovery(&self) -> MeshResult<()>;

    /// Dial a peer and open the mesh channel.
    ///
    /// Fails with `ConnectionTimeout` or `ConnectionRejected`.
    async fn connect(&self, peer: &PeerId) -> MeshResult<()>;

    /// Send one frame to a directly connected peer.
    ///
    /// Fails with `ChannelClosed` when no live channel exists.
    async fn send(&self, peer: &PeerId, frame: Bytes) -> MeshResult<()>;

    /// Subscribe to link events.
    ///
    /// Multiple subscribers may exist; events are broadcast to all.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Close the channel to one peer, emitting a disconnect event.
    async fn disconnect(&self, peer: &PeerId) -> MeshResult<()>;

    /// Close every channel and stop discovery.
    async fn disconnect_all(&self) -> MeshResult<()>;
}
