//! Active snapshot registry
//!
//! Snapshot readers register the LSN they read at. Stores consult the oldest
//! registered LSN before discarding superseded versions, so a version some
//! reader can still see is never reclaimed.

use parking_lot::Mutex;
use replistate_core::Lsn;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of LSNs with live snapshot readers
#[derive(Clone, Default)]
pub struct SnapshotRegistry {
    active: Arc<Mutex<BTreeMap<Lsn, usize>>>,
}

impl SnapshotRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader at `lsn`; dropping the guard unregisters it
    pub fn register(&self, lsn: Lsn) -> SnapshotGuard {
        *self.active.lock().entry(lsn).or_insert(0) += 1;
        SnapshotGuard {
            lsn,
            active: Arc::clone(&self.active),
        }
    }

    /// Register a reader at the LSN `current` reports
    ///
    /// `current` is read under the registry lock, so a concurrent
    /// [`horizon`](Self::horizon) either sees this reader or computes a
    /// horizon no newer than what the reader observes.
    pub fn register_current(&self, current: impl FnOnce() -> Lsn) -> SnapshotGuard {
        let mut active = self.active.lock();
        let lsn = current();
        *active.entry(lsn).or_insert(0) += 1;
        SnapshotGuard {
            lsn,
            active: Arc::clone(&self.active),
        }
    }

    /// Oldest LSN any reader may still observe, given the committed LSN
    pub fn horizon(&self, committed: impl FnOnce() -> Lsn) -> Lsn {
        let active = self.active.lock();
        let committed = committed();
        match active.keys().next() {
            Some(oldest) if *oldest < committed => *oldest,
            _ => committed,
        }
    }

    /// Oldest LSN with a live reader
    pub fn oldest(&self) -> Option<Lsn> {
        self.active.lock().keys().next().copied()
    }

    /// Number of live readers
    pub fn len(&self) -> usize {
        self.active.lock().values().sum()
    }

    /// Whether no reader is registered
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

/// A registered snapshot reader
pub struct SnapshotGuard {
    lsn: Lsn,
    active: Arc<Mutex<BTreeMap<Lsn, usize>>>,
}

impl SnapshotGuard {
    /// LSN the reader observes
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&self.lsn) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.lsn);
            }
        }
    }
}

impl std::fmt::Debug for SnapshotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotGuard").field("lsn", &self.lsn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tracks_live_guards() {
        let registry = SnapshotRegistry::new();
        assert_eq!(registry.oldest(), None);

        let a = registry.register(Lsn::new(5));
        let b = registry.register(Lsn::new(3));
        let c = registry.register(Lsn::new(3));
        assert_eq!(registry.oldest(), Some(Lsn::new(3)));
        assert_eq!(registry.len(), 3);

        drop(b);
        assert_eq!(registry.oldest(), Some(Lsn::new(3)));
        drop(c);
        assert_eq!(registry.oldest(), Some(Lsn::new(5)));
        assert_eq!(a.lsn(), Lsn::new(5));
        drop(a);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_horizon_is_bounded_by_readers() {
        let registry = SnapshotRegistry::new();
        assert_eq!(registry.horizon(|| Lsn::new(9)), Lsn::new(9));
        let guard = registry.register_current(|| Lsn::new(4));
        assert_eq!(guard.lsn(), Lsn::new(4));
        assert_eq!(registry.horizon(|| Lsn::new(9)), Lsn::new(4));
        drop(guard);
        assert_eq!(registry.horizon(|| Lsn::new(9)), Lsn::new(9));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_oldest_is_minimum_of_live_guards(
                lsns in proptest::collection::vec(0i64..100, 1..20),
                drop_mask in proptest::collection::vec(any::<bool>(), 20),
            ) {
                let registry = SnapshotRegistry::new();
                let mut guards: Vec<SnapshotGuard> =
                    lsns.iter().map(|l| registry.register(Lsn::new(*l))).collect();
                let mut index = 0;
                guards.retain(|_| {
                    let keep = !drop_mask[index];
                    index += 1;
                    keep
                });
                let expected = guards.iter().map(SnapshotGuard::lsn).min();
                prop_assert_eq!(registry.oldest(), expected);
                prop_assert_eq!(registry.len(), guards.len());
            }
        }
    }
}
