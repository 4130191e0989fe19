//! Core types for Tripmesh

use std::time::Instant;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable identifier for a device on the mesh
///
/// Survives restarts: the iroh transport derives it from the persisted
/// endpoint secret key, the memory transport uses whatever name it was
/// constructed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a PeerId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a trip group (assigned by the backend)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    /// Create a GroupId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a group member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    /// Create a MemberId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an expense
///
/// Locally authored drafts mint a ULID so ids are unique across devices and
/// sort by creation time; server-fetched rows keep the backend's id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl ExpenseId {
    /// Create an ExpenseId from an existing id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh time-ordered id for a locally authored expense
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection status of a peer on the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Channel negotiation in progress
    Connecting,
    /// Live bidirectional channel
    Connected,
    /// No channel; retained only until eviction
    Disconnected,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Connecting => write!(f, "connecting"),
            PeerStatus::Connected => write!(f, "connected"),
            PeerStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One entry per known device on the mesh
///
/// Created on first discovery or first inbound message. `last_seen` is a
/// monotonic instant updated on any traffic; the health sweep evicts records
/// whose silence exceeds the liveness timeout.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Stable device identifier
    pub peer_id: PeerId,
    /// Human-readable name announced by the peer
    pub display_name: String,
    /// Current channel status
    pub status: PeerStatus,
    /// Monotonic timestamp of the last traffic from this peer
    pub last_seen: Instant,
}

impl PeerRecord {
    /// Create a record for a freshly discovered peer
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            status: PeerStatus::Connecting,
            last_seen: Instant::now(),
        }
    }

    /// Update `last_seen` to now
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// How long this peer has been silent
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.elapsed()
    }
}

/// Origin markers for a mesh-relayed record
///
/// Distinguishes tentative peer-relayed state from authoritative server state
/// and locally authored drafts (both of which carry no provenance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Device that authored the record
    pub origin_peer: PeerId,
    /// Envelope timestamp at the origin (ms epoch)
    pub origin_timestamp: i64,
}

/// One member's share of an expense
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseSplit {
    /// The member owing this share
    pub member_id: MemberId,
    /// Share amount in minor units
    pub amount: i64,
}

/// Denormalized last-write-wins copy of an expense
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedExpense {
    /// Unique identifier
    pub id: ExpenseId,
    /// Owning group (secondary index key)
    pub group_id: GroupId,
    /// What the expense was for
    pub description: String,
    /// Total amount in minor units
    pub amount: i64,
    /// Member who paid
    pub paid_by: MemberId,
    /// Per-member shares; should sum to `amount`
    pub split: Vec<ExpenseSplit>,
    /// Unix timestamp (ms) of creation at the authoring device
    pub created_at: i64,
    /// Present when the row arrived via mesh relay rather than being
    /// locally authored or server-fetched
    pub provenance: Option<Provenance>,
}

impl CachedExpense {
    /// Create a locally authored expense (no provenance)
    pub fn new(
        group_id: GroupId,
        description: impl Into<String>,
        amount: i64,
        paid_by: MemberId,
        split: Vec<ExpenseSplit>,
    ) -> Self {
        Self {
            id: ExpenseId::generate(),
            group_id,
            description: description.into(),
            amount,
            paid_by,
            split,
            created_at: chrono::Utc::now().timestamp_millis(),
            provenance: None,
        }
    }

    /// Whether this row came in over the mesh
    pub fn is_mesh_originated(&self) -> bool {
        self.provenance.is_some()
    }
}

/// Denormalized copy of a trip group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedGroup {
    /// Unique identifier
    pub id: GroupId,
    /// Group name
    pub name: String,
    /// Unix timestamp (ms) this copy was cached
    pub cached_at: i64,
}

/// Denormalized copy of a group member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMember {
    /// Unique identifier
    pub id: MemberId,
    /// Group this member belongs to (secondary index key)
    pub group_id: GroupId,
    /// Display name
    pub display_name: String,
}

/// Metadata for a document snapshot (the blob itself lives with the backend)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    /// Unique identifier
    pub id: String,
    /// Owning member (secondary index key)
    pub owner_id: MemberId,
    /// File name
    pub name: String,
    /// MIME type as reported on upload
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
    /// Unix timestamp (ms) of upload
    pub uploaded_at: i64,
}

/// Kind of backend operation a queued mutation replays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// POST to the resource path
    Create,
    /// PATCH to the resource path
    Update,
    /// DELETE of the resource path
    Delete,
}

/// Replay status of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    /// Awaiting first replay attempt
    Pending,
    /// Confirmed by the backend; will never be replayed again
    Completed,
    /// Last attempt failed; retried on the next drain pass
    Failed,
}

impl MutationStatus {
    /// Stable string form used as the status index key
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Completed => "completed",
            MutationStatus::Failed => "failed",
        }
    }
}

/// One pending outbound operation awaiting durable replay to the backend
///
/// Never deleted on failure, only marked, so nothing is silently dropped.
/// Only the sync coordinator promotes a mutation to `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Store-assigned, monotonically increasing queue id
    pub id: u64,
    /// What kind of backend call to issue
    pub op: OperationKind,
    /// Target backend endpoint, e.g. `/groups/g1/expenses`
    pub resource_path: String,
    /// JSON body to send
    pub body: serde_json::Value,
    /// Current replay status
    pub status: MutationStatus,
    /// Number of failed replay attempts so far
    pub retry_count: u32,
    /// Unix timestamp (ms) of enqueue
    pub created_at: i64,
    /// Client-generated key so duplicate replays can collapse server-side
    pub idempotency_key: String,
}

impl QueuedMutation {
    /// Build an unenqueued mutation; the store assigns `id`, stamps
    /// `created_at` and mints the idempotency key on enqueue.
    pub fn new(op: OperationKind, resource_path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: 0,
            op,
            resource_path: resource_path.into(),
            body,
            status: MutationStatus::Pending,
            retry_count: 0,
            created_at: 0,
            idempotency_key: String::new(),
        }
    }
}

/// Net balance for one member within a trip package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberBalance {
    /// The member
    pub member_id: MemberId,
    /// Paid minus owed, in minor units; positive means others owe them
    pub net: i64,
}

/// Versioned full offline snapshot of one trip
///
/// A convenience bundle built from cached rows, not a separate source of
/// truth. Refreshed when older than the staleness window or on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripPackage {
    /// The trip group
    pub group_id: GroupId,
    /// Cached group row
    pub group: CachedGroup,
    /// All cached expenses for the group
    pub expenses: Vec<CachedExpense>,
    /// Net balance per member, computed from `expenses`
    pub balance: Vec<MemberBalance>,
    /// Unix timestamp (ms) the package was assembled
    pub cached_at: i64,
}

impl TripPackage {
    /// Assemble a package from cached rows, computing balances
    pub fn build(group: CachedGroup, expenses: Vec<CachedExpense>) -> Self {
        let balance = Self::compute_balance(&expenses);
        Self {
            group_id: group.id.clone(),
            group,
            expenses,
            balance,
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether the package is older than the given staleness window
    pub fn is_stale(&self, window: std::time::Duration) -> bool {
        let age_ms = chrono::Utc::now().timestamp_millis() - self.cached_at;
        age_ms > window.as_millis() as i64
    }

    /// Paid minus owed per member, sorted by member id for stable output
    fn compute_balance(expenses: &[CachedExpense]) -> Vec<MemberBalance> {
        use std::collections::BTreeMap;

        let mut net: BTreeMap<String, i64> = BTreeMap::new();
        for expense in expenses {
            *net.entry(expense.paid_by.0.clone()).or_default() += expense.amount;
            for share in &expense.split {
                *net.entry(share.member_id.0.clone()).or_default() -= share.amount;
            }
        }
        net.into_iter()
            .map(|(member_id, net)| MemberBalance {
                member_id: MemberId(member_id),
                net,
            })
            .collect()
    }
}
