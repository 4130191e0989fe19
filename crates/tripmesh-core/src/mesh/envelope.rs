//! Mesh wire envelope
//!
//! Every mesh message is one UTF-8 JSON object over the peer channel:
//!
//! ```text
//! {
//!   "type": "chat" | "expense" | "sync" | "ping",
//!   "from": "<origin peer id>",
//!   "to": "<peer id>",          // optional; absent = broadcast
//!   "timestamp": 1712345678901, // ms epoch, origin-assigned
//!   "data": { ... }             // type-specific payload, camelCase fields
//! }
//! ```
//!
//! `from` always identifies the *original* sender: relayers forward the
//! envelope unmodified. `(from, timestamp)` is the message identity used for
//! deduplication, which is why origins stamp strictly increasing timestamps.

use serde::{Deserialize, Serialize};

use crate::types::{CachedExpense, ExpenseId, GroupId, MemberId, PeerId, Provenance};

/// Type-specific payload, tagged by the wire `type` field with the body
/// under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum MeshPayload {
    /// A chat line for the group channel
    Chat(ChatBody),
    /// An expense mutation to apply locally and queue for replay
    Expense(ExpenseBody),
    /// Request for cached expenses of a group (bootstrap for late joiners)
    Sync(SyncBody),
    /// Keepalive; also carries the sender's display name
    Ping(PingBody),
}

impl MeshPayload {
    /// The wire `type` tag for this payload
    pub fn kind(&self) -> &'static str {
        match self {
            MeshPayload::Chat(_) => "chat",
            MeshPayload::Expense(_) => "expense",
            MeshPayload::Sync(_) => "sync",
            MeshPayload::Ping(_) => "ping",
        }
    }
}

/// Chat message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    /// Message text
    pub text: String,
    /// Author's display name at send time
    pub author: String,
}

/// Expense mutation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseAction {
    Create,
    Update,
    Delete,
}

/// Expense mutation body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseBody {
    /// What to do with the expense
    pub action: ExpenseAction,
    /// The expense itself
    pub expense: WireExpense,
}

/// Expense as it travels on the wire.
///
/// Carries no provenance: the receiver stamps `origin_peer`/`origin_timestamp`
/// from the envelope when caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireExpense {
    pub id: String,
    pub group_id: String,
    pub description: String,
    pub amount: i64,
    pub paid_by: String,
    pub split: Vec<WireSplit>,
    pub created_at: i64,
}

/// One member's share on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSplit {
    pub member_id: String,
    pub amount: i64,
}

impl From<&CachedExpense> for WireExpense {
    fn from(expense: &CachedExpense) -> Self {
        Self {
            id: expense.id.as_str().to_string(),
            group_id: expense.group_id.as_str().to_string(),
            description: expense.description.clone(),
            amount: expense.amount,
            paid_by: expense.paid_by.as_str().to_string(),
            split: expense
                .split
                .iter()
                .map(|s| WireSplit {
                    member_id: s.member_id.as_str().to_string(),
                    amount: s.amount,
                })
                .collect(),
            created_at: expense.created_at,
        }
    }
}

impl WireExpense {
    /// Build the cached row, stamping the given provenance.
    pub fn into_cached(self, provenance: Option<Provenance>) -> CachedExpense {
        CachedExpense {
            id: ExpenseId::new(self.id),
            group_id: GroupId::new(self.group_id),
            description: self.description,
            amount: self.amount,
            paid_by: MemberId::new(self.paid_by),
            split: self
                .split
                .into_iter()
                .map(|s| crate::types::ExpenseSplit {
                    member_id: MemberId::new(s.member_id),
                    amount: s.amount,
                })
                .collect(),
            created_at: self.created_at,
            provenance,
        }
    }
}

/// Sync-request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBody {
    /// Group whose cached expenses are requested
    pub group_id: String,
}

/// Keepalive body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingBody {
    /// Sender's display name, so neighbors can label the peer
    pub display_name: String,
}

/// The wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshEnvelope {
    /// Origin peer id; relayers must not rewrite it
    pub from: PeerId,
    /// Addressed recipient; `None` means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    /// Origin-assigned ms epoch, strictly increasing per origin
    pub timestamp: i64,
    /// Typed payload (wire `type` + `data`)
    #[serde(flatten)]
    pub payload: MeshPayload,
}

/// Message identity for relay/consumer deduplication
pub type MessageKey = (PeerId, i64);

impl MeshEnvelope {
    /// Encode to UTF-8 JSON bytes for the peer channel
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from UTF-8 JSON bytes
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// The `(from, timestamp)` identity of this message
    pub fn dedup_key(&self) -> MessageKey {
        (self.from.clone(), self.timestamp)
    }

    /// Whether this envelope is a broadcast (no addressed recipient)
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}
