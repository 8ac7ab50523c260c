//! Transaction-scoped lock manager
//!
//! Locks are owned by a transaction and held until it commits or aborts;
//! there is no early release of an individual lock.
//!
//! ## Modes
//!
//! | held \ requested | Shared | Update | Exclusive |
//! |------------------|--------|--------|-----------|
//! | Shared           | ok     | ok     | wait      |
//! | Update           | ok     | wait   | wait      |
//! | Exclusive        | wait   | wait   | wait      |
//!
//! A transaction re-requesting a resource it already holds is granted
//! immediately when its current mode covers the request, and otherwise
//! upgrades in place once the other holders allow it.
//!
//! Acquisition is dual-path: a free lock is granted synchronously
//! ([`Completion::Ready`]); a contended one suspends until granted, timed out,
//! or cancelled. A waiter that gives up holds nothing, so timeouts and
//! cancellation leave no partial state. Deadlocks resolve through timeouts.

use parking_lot::Mutex;
use replistate_core::{
    with_deadline, CancellationToken, Completion, StateResult, TransactionId,
};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Read lock
    Shared,
    /// Upgradeable read lock; one holder at a time, compatible with readers
    Update,
    /// Write lock
    Exclusive,
}

impl LockMode {
    /// Whether two different owners may hold `self` and `other` together
    pub fn is_compatible(self, other: LockMode) -> bool {
        matches!(
            (self, other),
            (LockMode::Shared, LockMode::Shared)
                | (LockMode::Shared, LockMode::Update)
                | (LockMode::Update, LockMode::Shared)
        )
    }

    /// Whether holding `self` satisfies a request for `requested`
    pub fn covers(self, requested: LockMode) -> bool {
        self >= requested
    }
}

struct LockEntry {
    holders: HashMap<TransactionId, LockMode>,
    notify: Arc<Notify>,
}

impl LockEntry {
    fn new() -> Self {
        LockEntry {
            holders: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

struct LockTable<R> {
    entries: HashMap<R, LockEntry>,
    owned: HashMap<TransactionId, Vec<R>>,
}

struct Inner<R> {
    table: Mutex<LockTable<R>>,
}

impl<R: Hash + Eq + Clone> Inner<R> {
    /// Grant if possible; returns whether the owner now holds the lock
    fn try_grant(&self, owner: TransactionId, resource: &R, mode: LockMode) -> bool {
        let mut table = self.table.lock();
        let entry = table
            .entries
            .entry(resource.clone())
            .or_insert_with(LockEntry::new);

        let held = entry.holders.get(&owner).copied();
        if held.map_or(false, |h| h.covers(mode)) {
            return true;
        }
        let wanted = held.map_or(mode, |h| h.max(mode));
        let compatible = entry
            .holders
            .iter()
            .filter(|(other, _)| **other != owner)
            .all(|(_, other_mode)| wanted.is_compatible(*other_mode));
        if !compatible {
            return false;
        }

        entry.holders.insert(owner, wanted);
        if held.is_none() {
            table.owned.entry(owner).or_default().push(resource.clone());
        }
        true
    }

    fn notifier(&self, resource: &R) -> Option<Arc<Notify>> {
        self.table
            .lock()
            .entries
            .get(resource)
            .map(|e| Arc::clone(&e.notify))
    }
}

/// Lock manager over resources of type `R`
pub struct LockManager<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for LockManager<R> {
    fn clone(&self) -> Self {
        LockManager {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Hash + Eq + Clone + Send + Sync + 'static> Default for LockManager<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Hash + Eq + Clone + Send + Sync + 'static> LockManager<R> {
    /// Empty lock table
    pub fn new() -> Self {
        LockManager {
            inner: Arc::new(Inner {
                table: Mutex::new(LockTable {
                    entries: HashMap::new(),
                    owned: HashMap::new(),
                }),
            }),
        }
    }

    /// Acquire `resource` in `mode` for `owner`
    ///
    /// Completes synchronously when the lock is grantable right away.
    pub fn acquire(
        &self,
        owner: TransactionId,
        resource: R,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<()>> {
        if let Err(e) = cancel.check() {
            return Completion::ready(Err(e));
        }
        if self.inner.try_grant(owner, &resource, mode) {
            return Completion::ready(Ok(()));
        }

        trace!(owner = %owner, ?mode, "Lock contended, waiting");
        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        Completion::pending(async move {
            let wait = async {
                loop {
                    let notify = match inner.notifier(&resource) {
                        Some(notify) => notify,
                        None => Arc::new(Notify::new()),
                    };
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if inner.try_grant(owner, &resource, mode) {
                        return Ok(());
                    }
                    notified.await;
                }
            };
            with_deadline(wait, timeout, &cancel, "lock acquisition").await
        })
    }

    /// Release every lock held by `owner`
    pub fn release_all(&self, owner: TransactionId) -> usize {
        let mut table = self.inner.table.lock();
        let Some(resources) = table.owned.remove(&owner) else {
            return 0;
        };
        let released = resources.len();
        for resource in resources {
            let now_empty = match table.entries.get_mut(&resource) {
                Some(entry) => {
                    entry.holders.remove(&owner);
                    entry.notify.notify_waiters();
                    entry.holders.is_empty()
                }
                None => false,
            };
            if now_empty {
                table.entries.remove(&resource);
            }
        }
        trace!(owner = %owner, released, "Released locks");
        released
    }

    /// Mode in which `owner` holds `resource`, if any
    pub fn held_mode(&self, owner: TransactionId, resource: &R) -> Option<LockMode> {
        self.inner
            .table
            .lock()
            .entries
            .get(resource)
            .and_then(|e| e.holders.get(&owner).copied())
    }

    /// Number of resources with at least one holder
    pub fn locked_resources(&self) -> usize {
        self.inner
            .table
            .lock()
            .entries
            .values()
            .filter(|e| !e.holders.is_empty())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replistate_core::StateError;

    const T1: TransactionId = TransactionId(1);
    const T2: TransactionId = TransactionId(2);
    const SHORT: Duration = Duration::from_millis(30);

    fn manager() -> LockManager<&'static str> {
        LockManager::new()
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        assert!(Shared.is_compatible(Shared));
        assert!(Shared.is_compatible(Update));
        assert!(Update.is_compatible(Shared));
        assert!(!Update.is_compatible(Update));
        assert!(!Shared.is_compatible(Exclusive));
        assert!(!Exclusive.is_compatible(Shared));
        assert!(!Exclusive.is_compatible(Exclusive));
    }

    #[tokio::test]
    async fn test_free_lock_is_synchronous() {
        let locks = manager();
        let c = locks.acquire(T1, "k", LockMode::Exclusive, SHORT, &CancellationToken::none());
        assert!(c.is_synchronous());
        assert!(c.await.is_ok());
        assert_eq!(locks.held_mode(T1, &"k"), Some(LockMode::Exclusive));
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let locks = manager();
        let none = CancellationToken::none();
        assert!(locks.acquire(T1, "k", LockMode::Shared, SHORT, &none).await.is_ok());
        let c = locks.acquire(T2, "k", LockMode::Shared, SHORT, &none);
        assert!(c.is_synchronous());
        assert!(c.await.is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_conflict_times_out() {
        let locks = manager();
        let none = CancellationToken::none();
        locks.acquire(T1, "k", LockMode::Exclusive, SHORT, &none).await.unwrap();
        let c = locks.acquire(T2, "k", LockMode::Shared, SHORT, &none);
        assert!(!c.is_synchronous());
        assert!(matches!(c.await, Err(StateError::Timeout { .. })));
        assert_eq!(locks.held_mode(T2, &"k"), None);
    }

    #[tokio::test]
    async fn test_waiter_granted_after_release() {
        let locks = manager();
        let none = CancellationToken::none();
        locks.acquire(T1, "k", LockMode::Exclusive, SHORT, &none).await.unwrap();

        let waiter = locks.acquire(T2, "k", LockMode::Exclusive, Duration::from_secs(5), &none);
        let handle = tokio::spawn(async move { waiter.await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(locks.release_all(T1), 1);

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(locks.held_mode(T2, &"k"), Some(LockMode::Exclusive));
    }

    #[tokio::test]
    async fn test_upgrade_in_place() {
        let locks = manager();
        let none = CancellationToken::none();
        locks.acquire(T1, "k", LockMode::Update, SHORT, &none).await.unwrap();
        let c = locks.acquire(T1, "k", LockMode::Shared, SHORT, &none);
        assert!(c.is_synchronous());
        c.await.unwrap();
        locks.acquire(T1, "k", LockMode::Exclusive, SHORT, &none).await.unwrap();
        assert_eq!(locks.held_mode(T1, &"k"), Some(LockMode::Exclusive));
        assert_eq!(locks.release_all(T1), 1);
        assert_eq!(locks.locked_resources(), 0);
    }

    #[tokio::test]
    async fn test_update_blocks_second_update() {
        let locks = manager();
        let none = CancellationToken::none();
        locks.acquire(T1, "k", LockMode::Update, SHORT, &none).await.unwrap();
        assert!(locks.acquire(T2, "k", LockMode::Shared, SHORT, &none).await.is_ok());
        assert!(locks
            .acquire(TransactionId(3), "k", LockMode::Update, SHORT, &none)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let locks = manager();
        let none = CancellationToken::none();
        locks.acquire(T1, "k", LockMode::Exclusive, SHORT, &none).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = locks.acquire(T2, "k", LockMode::Exclusive, Duration::from_secs(5), &cancel);
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        assert!(matches!(waiter.await, Err(StateError::OperationCanceled)));
        assert_eq!(locks.held_mode(T2, &"k"), None);
    }
}
