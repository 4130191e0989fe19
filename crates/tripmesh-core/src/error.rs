//! Error types for Tripmesh

use thiserror::Error;

/// Main error type for Tripmesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Host has no usable short-range transport; mesh features are disabled
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    /// Dialing a peer timed out
    #[error("Connection to {0} timed out")]
    ConnectionTimeout(String),

    /// Peer refused the connection
    #[error("Connection to {0} rejected: {1}")]
    ConnectionRejected(String, String),

    /// The channel to a peer is gone; the peer is dropped from the active set
    #[error("Channel to {0} closed")]
    ChannelClosed(String),

    /// Backend replay of a queued mutation failed
    #[error("Replay failed: {0}")]
    ReplayFailed(String),

    /// Token refresh failed; replay gives up until re-triggered
    #[error("Auth error: {0}")]
    Auth(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed mesh envelope received from a peer
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Group is not known to the local store
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl MeshError {
    /// Whether retrying later could succeed without user action.
    ///
    /// Permanent errors (no radio, auth exhaustion) surface to the user;
    /// transient ones are absorbed into mutation status changes.
    pub fn is_transient(&self) -> bool {
        !matches!(self, MeshError::RadioUnavailable(_) | MeshError::Auth(_))
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::ChannelClosed("peer-a".to_string());
        assert_eq!(format!("{}", err), "Channel to peer-a closed");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let mesh_err: MeshError = io_err.into();
        assert!(matches!(mesh_err, MeshError::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(MeshError::ReplayFailed("503".into()).is_transient());
        assert!(MeshError::ConnectionTimeout("p".into()).is_transient());
        assert!(!MeshError::RadioUnavailable("no bluetooth".into()).is_transient());
        assert!(!MeshError::Auth("refresh exhausted".into()).is_transient());
    }
}
