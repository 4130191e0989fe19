//! QUIC peer transport over iroh
//!
//! Each peer pair shares one QUIC connection on the mesh ALPN; every envelope
//! travels as its own unidirectional stream, so stream boundaries are the
//! frame boundaries. Peer ids are the hex endpoint id, which survives
//! restarts because the endpoint secret key is persisted in the store.
//!
//! Peer addresses arrive out-of-band (`add_peer_addr`, e.g. from a scanned
//! invite) and are fed to a static discovery provider; inbound connections on
//! the mesh ALPN register the peer automatically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::Connection;
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, PublicKey, SecretKey};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent, TRANSPORT_EVENT_CAPACITY};
use crate::error::{MeshError, MeshResult};
use crate::types::PeerId;

/// ALPN protocol identifier for the mesh channel
pub const MESH_ALPN: &[u8] = b"/tripmesh/mesh/0";

/// Maximum size of a single envelope frame
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Dial timeout before reporting `ConnectionTimeout`
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type ChannelMap = Arc<tokio::sync::Mutex<HashMap<PeerId, Connection>>>;

/// Production peer transport over iroh QUIC channels
pub struct IrohTransport {
    endpoint: Endpoint,
    router: Router,
    static_provider: StaticProvider,
    local: PeerId,
    event_tx: broadcast::Sender<TransportEvent>,
    channels: ChannelMap,
    known_addrs: Arc<parking_lot::Mutex<HashMap<PeerId, EndpointAddr>>>,
}

impl IrohTransport {
    /// Bind the endpoint and register the mesh protocol.
    ///
    /// Pass the persisted secret key to keep a stable peer id across
    /// restarts; `None` generates a fresh identity. Fails with
    /// `RadioUnavailable` when the endpoint cannot bind.
    pub async fn bind(secret_key: Option<SecretKey>) -> MeshResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![MESH_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| MeshError::RadioUnavailable(format!("failed to bind endpoint: {}", e)))?;

        let local = PeerId::new(hex::encode(endpoint.id().as_bytes()));
        let (event_tx, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);
        let channels: ChannelMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));

        let handler = MeshProtocolHandler {
            event_tx: event_tx.clone(),
            channels: channels.clone(),
        };
        let router = Router::builder(endpoint.clone())
            .accept(MESH_ALPN, handler)
            .spawn();

        info!(peer = %local, "Mesh transport bound");

        Ok(Self {
            endpoint,
            router,
            static_provider,
            local,
            event_tx,
            channels,
            known_addrs: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        })
    }

    /// Register a peer's address learned out-of-band.
    ///
    /// Makes the address known to iroh discovery and surfaces the peer as
    /// discovered.
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        let peer = PeerId::new(hex::encode(addr.id.as_bytes()));
        debug!(peer = %peer, addrs = addr.addrs.len(), "Adding peer address");

        self.static_provider.add_endpoint_info(addr.clone());
        self.known_addrs.lock().insert(peer.clone(), addr);

        let _ = self.event_tx.send(TransportEvent::Discovered {
            peer,
            display_name: String::new(),
        });
    }

    /// This device's full endpoint address, for sharing with peers
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Tear the transport down completely (router and endpoint).
    pub async fn shutdown(self) {
        let _ = self.router.shutdown().await;
        self.endpoint.close().await;
    }

    fn endpoint_id_for(peer: &PeerId) -> MeshResult<PublicKey> {
        let bytes = hex::decode(peer.as_str())
            .map_err(|e| MeshError::InvalidOperation(format!("bad peer id {}: {}", peer, e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MeshError::InvalidOperation(format!("bad peer id length: {}", peer)))?;
        PublicKey::from_bytes(&arr)
            .map_err(|e| MeshError::InvalidOperation(format!("bad peer id {}: {}", peer, e)))
    }

    /// Read envelopes off a connection until it closes.
    ///
    /// Shared by the dialing and accepting sides; whichever side opened the
    /// connection, frames flow both ways as unidirectional streams.
    async fn recv_loop(
        connection: Connection,
        peer: PeerId,
        event_tx: broadcast::Sender<TransportEvent>,
        channels: ChannelMap,
    ) {
        loop {
            match connection.accept_uni().await {
                Ok(mut recv) => match recv.read_to_end(MAX_FRAME_BYTES).await {
                    Ok(bytes) => {
                        let _ = event_tx.send(TransportEvent::Message {
                            from: peer.clone(),
                            frame: Bytes::from(bytes),
                        });
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Failed to read frame");
                    }
                },
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Connection closed");
                    break;
                }
            }
        }

        channels.lock().await.remove(&peer);
        let _ = event_tx.send(TransportEvent::Disconnected(peer));
    }
}

#[async_trait::async_trait]
impl Transport for IrohTransport {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn start_discovery(&self) -> MeshResult<()> {
        // Browsing is handled by the endpoint's discovery services; re-announce
        // addresses registered out-of-band so late subscribers see them.
        let known: Vec<PeerId> = self.known_addrs.lock().keys().cloned().collect();
        for peer in known {
            let _ = self.event_tx.send(TransportEvent::Discovered {
                peer,
                display_name: String::new(),
            });
        }
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> MeshResult<()> {
        if self.channels.lock().await.contains_key(peer) {
            return Ok(());
        }

        // Prefer an address learned out-of-band; otherwise dial by id and let
        // discovery resolve it
        let addr = match self.known_addrs.lock().get(peer).cloned() {
            Some(addr) => addr,
            None => EndpointAddr::new(Self::endpoint_id_for(peer)?),
        };

        let connection = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.endpoint.connect(addr, MESH_ALPN),
        )
        .await
        .map_err(|_| MeshError::ConnectionTimeout(peer.to_string()))?
        .map_err(|e| MeshError::ConnectionRejected(peer.to_string(), e.to_string()))?;

        self.channels
            .lock()
            .await
            .insert(peer.clone(), connection.clone());

        tokio::spawn(Self::recv_loop(
            connection,
            peer.clone(),
            self.event_tx.clone(),
            self.channels.clone(),
        ));

        info!(peer = %peer, "Connected to peer");
        let _ = self.event_tx.send(TransportEvent::Connected(peer.clone()));
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: Bytes) -> MeshResult<()> {
        let connection = self
            .channels
            .lock()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| MeshError::ChannelClosed(peer.to_string()))?;

        let mut send = connection
            .open_uni()
            .await
            .map_err(|e| MeshError::ChannelClosed(format!("{}: {}", peer, e)))?;
        send.write_all(&frame)
            .await
            .map_err(|e| MeshError::ChannelClosed(format!("{}: {}", peer, e)))?;
        // Finish the send side so the receiver knows the frame is complete
        send.finish()
            .map_err(|e| MeshError::ChannelClosed(format!("{}: {}", peer, e)))?;

        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn disconnect(&self, peer: &PeerId) -> MeshResult<()> {
        if let Some(connection) = self.channels.lock().await.remove(peer) {
            connection.close(0u32.into(), b"evicted");
            let _ = self.event_tx.send(TransportEvent::Disconnected(peer.clone()));
        }
        Ok(())
    }

    async fn disconnect_all(&self) -> MeshResult<()> {
        let drained: Vec<(PeerId, Connection)> =
            self.channels.lock().await.drain().collect();
        for (peer, connection) in drained {
            connection.close(0u32.into(), b"shutdown");
            let _ = self.event_tx.send(TransportEvent::Disconnected(peer));
        }
        Ok(())
    }
}

/// Protocol handler for inbound mesh connections
#[derive(Clone)]
struct MeshProtocolHandler {
    event_tx: broadcast::Sender<TransportEvent>,
    channels: ChannelMap,
}

impl std::fmt::Debug for MeshProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshProtocolHandler").finish()
    }
}

impl ProtocolHandler for MeshProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let event_tx = self.event_tx.clone();
        let channels = self.channels.clone();

        async move {
            let peer = PeerId::new(hex::encode(conn.remote_id().as_bytes()));
            debug!(peer = %peer, "Accepting mesh connection");

            channels.lock().await.insert(peer.clone(), conn.clone());
            let _ = event_tx.send(TransportEvent::Discovered {
                peer: peer.clone(),
                display_name: String::new(),
            });
            let _ = event_tx.send(TransportEvent::Connected(peer.clone()));

            // Serve the connection until the peer goes away
            IrohTransport::recv_loop(conn, peer, event_tx, channels).await;
            Ok(())
        }
    }
}
