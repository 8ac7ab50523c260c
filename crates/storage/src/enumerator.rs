//! Snapshot enumerators
//!
//! Enumerators always read at a fixed snapshot LSN, whatever isolation level
//! the store transaction uses for single-key reads. They are lazy: each step
//! looks up the next key after the cursor in the live store, so a long scan
//! never copies the store. A registered snapshot keeps every version the
//! enumerator may still need from being reclaimed, so commits that land
//! while it is being drained stay invisible.
//!
//! The enumerating transaction's own buffered writes are merged in: an own
//! write shadows the committed record for its key, and an own remove hides
//! it.

use crate::store::Store;
use replistate_concurrency::SnapshotGuard;
use replistate_core::{Lsn, StoreKey, StoreValue, VersionedValue};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Lazy, ordered, non-restartable scan of `(key, version, value)`
pub struct StoreEnumerator<K, V> {
    store: std::sync::Arc<Store<K, V>>,
    _snapshot: SnapshotGuard,
    lsn: Lsn,
    lower: Bound<K>,
    upper: Bound<K>,
    own_writes: BTreeMap<K, Option<VersionedValue<V>>>,
    done: bool,
}

impl<K: StoreKey, V: StoreValue> StoreEnumerator<K, V> {
    pub(crate) fn new(
        store: std::sync::Arc<Store<K, V>>,
        snapshot: SnapshotGuard,
        lower: Bound<K>,
        upper: Bound<K>,
        own_writes: BTreeMap<K, Option<VersionedValue<V>>>,
    ) -> Self {
        let done = range_is_empty(&lower, &upper);
        StoreEnumerator {
            store,
            lsn: snapshot.lsn(),
            _snapshot: snapshot,
            lower,
            upper,
            own_writes,
            done,
        }
    }

    /// LSN the enumerator reads at
    pub fn snapshot_lsn(&self) -> Lsn {
        self.lsn
    }

    fn next_own(&self) -> Option<(K, Option<VersionedValue<V>>)> {
        if range_is_empty(&self.lower, &self.upper) {
            return None;
        }
        self.own_writes
            .range::<K, _>((bound_ref(&self.lower), bound_ref(&self.upper)))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Advance to the next visible entry
    pub fn next_entry(&mut self) -> Option<(K, VersionedValue<V>)> {
        while !self.done {
            let committed = self
                .store
                .next_visible(bound_ref(&self.lower), bound_ref(&self.upper), self.lsn);
            let own = self.next_own();

            let (key, entry) = match (committed, own) {
                (None, None) => {
                    self.done = true;
                    return None;
                }
                (Some((ck, cv)), None) => (ck, Some(cv)),
                (None, Some((ok, ov))) => (ok, ov),
                (Some((ck, cv)), Some((ok, ov))) => {
                    if ok <= ck {
                        (ok, ov)
                    } else {
                        (ck, Some(cv))
                    }
                }
            };

            self.lower = Bound::Excluded(key.clone());
            if range_is_empty(&self.lower, &self.upper) {
                self.done = true;
            }
            if let Some(entry) = entry {
                return Some((key, entry));
            }
        }
        None
    }
}

impl<K: StoreKey, V: StoreValue> Iterator for StoreEnumerator<K, V> {
    type Item = (K, VersionedValue<V>);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}

impl<K, V> std::fmt::Debug for StoreEnumerator<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEnumerator")
            .field("lsn", &self.lsn)
            .field("done", &self.done)
            .finish()
    }
}

/// Lazy, ordered, non-restartable scan of keys
pub struct KeyEnumerator<K, V> {
    inner: StoreEnumerator<K, V>,
}

impl<K: StoreKey, V: StoreValue> KeyEnumerator<K, V> {
    pub(crate) fn new(inner: StoreEnumerator<K, V>) -> Self {
        KeyEnumerator { inner }
    }

    /// LSN the enumerator reads at
    pub fn snapshot_lsn(&self) -> Lsn {
        self.inner.snapshot_lsn()
    }
}

impl<K: StoreKey, V: StoreValue> Iterator for KeyEnumerator<K, V> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.inner.next_entry().map(|(k, _)| k)
    }
}

pub(crate) fn bound_ref<K>(bound: &Bound<K>) -> Bound<&K> {
    match bound {
        Bound::Included(k) => Bound::Included(k),
        Bound::Excluded(k) => Bound::Excluded(k),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Whether no key fits between `lower` and `upper`
///
/// `BTreeMap::range` panics on inverted ranges, so callers check first.
pub(crate) fn range_is_empty<K: Ord>(lower: &Bound<K>, upper: &Bound<K>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_is_empty() {
        use Bound::*;
        assert!(!range_is_empty(&Included(1), &Included(1)));
        assert!(range_is_empty(&Included(2), &Included(1)));
        assert!(range_is_empty(&Excluded(1), &Excluded(1)));
        assert!(range_is_empty(&Excluded(1), &Included(1)));
        assert!(!range_is_empty(&Excluded(1), &Unbounded));
        assert!(!range_is_empty::<i32>(&Unbounded, &Unbounded));
    }
}
