//! Isolation levels and locking hints

use serde::{Deserialize, Serialize};

/// Read isolation level of a store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads observe the store as of the store transaction's start
    Snapshot,
    /// Reads take a shared lock held until commit or abort
    RepeatableRead,
}

impl IsolationLevel {
    /// Default single-key read isolation
    ///
    /// Primary, writable transactions read under `RepeatableRead`; reads on a
    /// secondary or inside a read-only transaction use `Snapshot`.
    pub fn default_for(is_primary: bool, is_read_only: bool) -> Self {
        if is_primary && !is_read_only {
            IsolationLevel::RepeatableRead
        } else {
            IsolationLevel::Snapshot
        }
    }
}

/// Locking hints applied to reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockingHints {
    /// Plain reads
    #[default]
    None,
    /// Reads take an upgradeable lock so a later write in the same
    /// transaction cannot be beaten by a concurrent writer
    UpdateLock,
}
