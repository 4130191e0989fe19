//! Mesh protocol and relay
//!
//! Defines the wire envelope, broadcast semantics, and the one-hop
//! store-and-forward relay on top of the peer transport.
//!
//! ## Overview
//!
//! Every device runs one [`MeshNode`]. Outbound payloads are stamped with the
//! local peer id and a strictly increasing timestamp, then sent to every
//! connected peer. Inbound envelopes are deduplicated by `(from, timestamp)`,
//! relayed one hop when addressed to a reachable third peer, filtered when
//! they originated here, and otherwise delivered exactly once to every
//! subscriber.
//!
//! Reachability degrades gracefully: a message reaches direct neighbors
//! always, and peers one relay hop away when a mutual neighbor is connected.

pub mod envelope;
pub mod node;

pub use envelope::{
    ChatBody, ExpenseAction, ExpenseBody, MeshEnvelope, MeshPayload, MessageKey, PingBody,
    SyncBody, WireExpense, WireSplit,
};
pub use node::{MeshEvent, MeshNode};
