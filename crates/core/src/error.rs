//! Error types for replistate
//!
//! This module defines the single error enum used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Propagation policy
//!
//! Per-operation outcomes such as a CAS mismatch or a missing key are returned
//! as ordinary values (`bool`, `Option`) and never show up here. Everything in
//! this enum is a failure that aborts the calling operation. Each variant
//! belongs to one [`ErrorCategory`]:
//!
//! - **Contention**: the caller asked for something the current state forbids
//! - **Resource**: timeout or cancellation, always locally recoverable
//! - **Role**: the replica is not in a position to serve the request right now
//! - **Fatal**: data integrity is at stake and the host must fault the replica

use crate::types::{Lsn, StateProviderName};
use std::io;
use thiserror::Error;

/// Result type alias for replistate operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Classification of an error, used by callers to pick a recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller error or validation failure; retrying the same request fails again
    Contention,
    /// Timeout or cancellation; a fresh transaction may retry
    Resource,
    /// Role or configuration mismatch; wait and retry at a higher layer
    Role,
    /// Data integrity failure; must reach the replica lifecycle owner
    Fatal,
}

/// Error types for replistate
#[derive(Debug, Error)]
pub enum StateError {
    /// Add of a key that is currently visible
    #[error("Key already exists")]
    KeyAlreadyExists,

    /// Add of a state provider name that is already registered
    #[error("State provider already exists: {0}")]
    NameAlreadyExists(StateProviderName),

    /// Remove or lookup of an unknown state provider name
    #[error("State provider not found: {0}")]
    NameNotFound(StateProviderName),

    /// The operation did not complete within its timeout
    #[error("Operation timed out: {operation}")]
    Timeout {
        /// What was being waited on
        operation: String,
    },

    /// The operation was cancelled through its cancellation token
    #[error("Operation canceled")]
    OperationCanceled,

    /// The replica is not primary
    #[error("Replica is not primary")]
    NotPrimary,

    /// The replica is primary but write access has not been granted yet
    #[error("Reconfiguration pending")]
    ReconfigurationPending,

    /// A backup chain is missing a link or is out of order
    #[error("Invalid backup chain: {0}")]
    InvalidBackupChain(String),

    /// The transaction is not in a state that allows the operation
    #[error("Transaction not active (state: {state})")]
    TransactionNotActive {
        /// Current transaction state
        state: String,
    },

    /// A write was attempted through a read-only transaction
    #[error("Transaction is read-only")]
    ReadOnlyTransaction,

    /// The state provider has been closed or removed
    #[error("State provider is closed: {0}")]
    ProviderClosed(String),

    /// Writing or publishing a checkpoint failed
    #[error("Checkpoint failed at {lsn}: {reason}")]
    CheckpointFailed {
        /// Checkpoint boundary that was being written
        lsn: Lsn,
        /// Underlying reason
        reason: String,
    },

    /// Restoring from a backup failed
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// A logged type descriptor could not be decoded
    #[error("Unknown type descriptor: {0:?}")]
    TypeDescriptorDecode(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The replicator rejected or failed to make a commit durable
    #[error("Replication failed: {0}")]
    ReplicationFailed(String),

    /// Value exceeds the configured size bound
    #[error("Value too large: {size} bytes (limit {limit})")]
    ValueTooLarge {
        /// Encoded size of the value
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StateError {
    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>) -> Self {
        StateError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an invalid-operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        StateError::InvalidOperation(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        StateError::Corruption(msg.into())
    }

    /// Create a checkpoint failure at the given boundary
    pub fn checkpoint_failed(lsn: Lsn, reason: impl std::fmt::Display) -> Self {
        StateError::CheckpointFailed {
            lsn,
            reason: reason.to_string(),
        }
    }

    /// Which §7 class this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            StateError::KeyAlreadyExists
            | StateError::NameAlreadyExists(_)
            | StateError::NameNotFound(_)
            | StateError::TransactionNotActive { .. }
            | StateError::ReadOnlyTransaction
            | StateError::ProviderClosed(_)
            | StateError::ValueTooLarge { .. }
            | StateError::InvalidOperation(_) => ErrorCategory::Contention,
            StateError::Timeout { .. } | StateError::OperationCanceled => ErrorCategory::Resource,
            StateError::NotPrimary
            | StateError::ReconfigurationPending
            | StateError::InvalidBackupChain(_)
            | StateError::ReplicationFailed(_) => ErrorCategory::Role,
            StateError::CheckpointFailed { .. }
            | StateError::RestoreFailed(_)
            | StateError::TypeDescriptorDecode(_)
            | StateError::Corruption(_)
            | StateError::Serialization(_)
            | StateError::Io(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether a fresh transaction may retry the request locally
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Resource
    }

    /// Whether the error must fault the replica
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }
}

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_timeout() {
        let err = StateError::timeout("lock wait");
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("lock wait"));
    }

    #[test]
    fn test_error_display_name_not_found() {
        let name = StateProviderName::new("fabric:/app/dict").unwrap();
        let err = StateError::NameNotFound(name);
        assert!(err.to_string().contains("fabric:/app/dict"));
    }

    #[test]
    fn test_error_display_checkpoint_failed() {
        let err = StateError::checkpoint_failed(Lsn::new(42), "disk full");
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_categories_follow_taxonomy() {
        assert_eq!(
            StateError::KeyAlreadyExists.category(),
            ErrorCategory::Contention
        );
        assert_eq!(
            StateError::OperationCanceled.category(),
            ErrorCategory::Resource
        );
        assert_eq!(StateError::NotPrimary.category(), ErrorCategory::Role);
        assert_eq!(
            StateError::InvalidBackupChain("gap".into()).category(),
            ErrorCategory::Role
        );
        assert_eq!(
            StateError::TypeDescriptorDecode("x".into()).category(),
            ErrorCategory::Fatal
        );
    }

    #[test]
    fn test_retryable_and_fatal() {
        assert!(StateError::timeout("x").is_retryable());
        assert!(!StateError::timeout("x").is_fatal());
        assert!(StateError::RestoreFailed("boom".into()).is_fatal());
        assert!(!StateError::ReconfigurationPending.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: StateError = io_err.into();
        assert!(matches!(err, StateError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_from_bincode() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let result: StateResult<String> =
            bincode::deserialize(&invalid_data).map_err(|e| e.into());
        assert!(matches!(result, Err(StateError::Serialization(_))));
    }
}
