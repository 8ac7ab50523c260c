//! Version chains: per-key MVCC history
//!
//! Versions are stored newest-first, so a snapshot read scans from the front
//! until it finds the first version at or below its LSN.
//!
//! # Performance
//!
//! Uses VecDeque for O(1) push_front. Keys that are updated repeatedly (the
//! CAS workload) only ever touch the front of the deque.

use replistate_core::{Lsn, VersionedRecord};
use std::collections::VecDeque;

/// All retained versions of one key, newest first
#[derive(Debug, Clone)]
pub struct VersionChain<V> {
    versions: VecDeque<VersionedRecord<V>>,
}

impl<V> VersionChain<V> {
    /// Chain holding a single record
    pub fn new(record: VersionedRecord<V>) -> Self {
        let mut versions = VecDeque::with_capacity(2);
        versions.push_front(record);
        VersionChain { versions }
    }

    /// Add a newer version
    #[inline]
    pub fn push(&mut self, record: VersionedRecord<V>) {
        debug_assert!(
            self.versions
                .front()
                .map_or(true, |latest| latest.version < record.version),
            "versions must be pushed in increasing LSN order"
        );
        self.versions.push_front(record);
    }

    /// Newest version at or below `lsn`, tombstones included
    pub fn get_at(&self, lsn: Lsn) -> Option<&VersionedRecord<V>> {
        self.versions.iter().find(|r| r.version <= lsn)
    }

    /// Newest version
    #[inline]
    pub fn latest(&self) -> Option<&VersionedRecord<V>> {
        self.versions.front()
    }

    /// Newest live (non-tombstone) version at or below `lsn`
    pub fn visible_at(&self, lsn: Lsn) -> Option<&VersionedRecord<V>> {
        self.get_at(lsn).filter(|r| !r.is_tombstone())
    }

    /// Whether the newest version is live
    pub fn is_live(&self) -> bool {
        self.latest().map_or(false, |r| !r.is_tombstone())
    }

    /// Drop versions no reader at or above `horizon` can observe
    ///
    /// The newest version at or below the horizon is what the oldest reader
    /// sees, so everything older than it goes.
    pub fn gc(&mut self, horizon: Lsn) {
        if let Some(keep) = self.versions.iter().position(|r| r.version <= horizon) {
            self.versions.truncate(keep + 1);
        }
    }

    /// Whether the chain is a lone tombstone every reader already sees
    pub fn is_reclaimable(&self, horizon: Lsn) -> bool {
        self.versions.len() == 1
            && self
                .versions
                .front()
                .map_or(true, |r| r.is_tombstone() && r.version <= horizon)
    }

    /// Number of versions stored
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Versions newest first, optionally limited
    pub fn history(&self, limit: Option<usize>) -> Vec<&VersionedRecord<V>> {
        let iter = self.versions.iter();
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Whether the chain holds no versions
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
