//! Tripmesh Core Library
//!
//! Offline-first peer mesh synchronization for trip coordination.
//!
//! ## Overview
//!
//! A group of devices on the same trip exchange chat messages and expense
//! mutations over short-range peer links while no server connectivity exists,
//! and every mutation is queued durably for replay to the backend once
//! connectivity returns. Three timelines are reconciled without a central
//! arbiter: local user actions, peer-relayed updates, and eventual server
//! replay.
//!
//! ## Core Principles
//!
//! - **Local-first**: every mutation lands in the local store immediately;
//!   the backend catches up when it can
//! - **Leaderless**: peers relay state to each other; whoever reaches the
//!   backend first replays it, idempotency keys collapse the duplicates
//! - **Nothing silently dropped**: queued mutations are only ever marked,
//!   never deleted on failure
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use tripmesh_core::{GroupId, HttpBackend, MeshConfig, MeshEngine, StaticTokenSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(HttpBackend::new(
//!         "https://api.example.com/v1",
//!         Arc::new(StaticTokenSource::new("access-token")),
//!     ));
//!     let engine = MeshEngine::with_iroh(
//!         "~/.tripmesh/data",
//!         MeshConfig::with_display_name("Alice's phone"),
//!         backend,
//!     )
//!     .await?;
//!     engine.start().await?;
//!
//!     engine.set_active_group(Some(GroupId::new("g1")));
//!     engine.send_chat("meet at the harbor at 9").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod mesh;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use backend::{BackendApi, HttpBackend, StaticTokenSource, TokenSource, IDEMPOTENCY_HEADER};
pub use config::MeshConfig;
pub use coordinator::{ConnectivityState, SyncCoordinator, SyncEvent, SyncOutcome};
pub use engine::{MeshEngine, NodeInfo};
pub use error::{MeshError, MeshResult};
pub use mesh::{
    ChatBody, ExpenseAction, ExpenseBody, MeshEnvelope, MeshEvent, MeshNode, MeshPayload,
    PingBody, SyncBody, WireExpense, WireSplit,
};
pub use store::Store;
pub use transport::{
    IrohTransport, MemoryHub, MemoryTransport, Transport, TransportEvent,
};
pub use types::*;
