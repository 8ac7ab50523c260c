//! Versioned record: the unit of stored data
//!
//! A record is a value plus the LSN at which it became visible. A record
//! without a value is a tombstone: a logical delete kept around so that
//! snapshot readers and version checks still see the deletion.

use crate::types::Lsn;
use serde::{Deserialize, Serialize};

/// A value with the commit LSN that produced it
///
/// ## Invariants
///
/// - `version` is the commit LSN of the transaction that wrote this record
/// - Records are never modified after creation
/// - `value == None` marks a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord<V> {
    /// The value, or `None` for a tombstone
    pub value: Option<V>,
    /// LSN at which this record became visible
    pub version: Lsn,
}

impl<V> VersionedRecord<V> {
    /// A live record
    pub fn new(value: V, version: Lsn) -> Self {
        VersionedRecord {
            value: Some(value),
            version,
        }
    }

    /// A tombstone
    pub fn tombstone(version: Lsn) -> Self {
        VersionedRecord {
            value: None,
            version,
        }
    }

    /// Whether this record marks a deletion
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Reference to the value, if live
    #[inline]
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Map the value to a new type
    pub fn map<U, F>(self, f: F) -> VersionedRecord<U>
    where
        F: FnOnce(V) -> U,
    {
        VersionedRecord {
            value: self.value.map(f),
            version: self.version,
        }
    }
}

/// A committed value as returned to readers: `(version, value)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue<V> {
    /// Commit LSN of the value
    pub version: Lsn,
    /// The value
    pub value: V,
}

impl<V> VersionedValue<V> {
    /// Create a versioned value
    pub fn new(version: Lsn, value: V) -> Self {
        VersionedValue { version, value }
    }
}
