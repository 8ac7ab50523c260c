//! Store: durable, versioned, transactional key/value collection
//!
//! # Design
//!
//! - `BTreeMap<K, VersionChain<V>>` behind a parking_lot RwLock: ordered
//!   scans for enumerators, newest-first chains for snapshot reads
//! - Per-key locks from a store-local [`LockManager`], owned by the
//!   transaction and released at commit or abort
//! - One [`StoreTransaction`] per (store, transaction), found through a
//!   DashMap keyed by transaction id
//!
//! # Reads
//!
//! | isolation / hint            | lock taken | reads                    |
//! |-----------------------------|------------|--------------------------|
//! | Snapshot                    | none       | at the snapshot LSN      |
//! | RepeatableRead              | Shared     | latest committed         |
//! | any + UpdateLock (writable) | Update     | latest committed         |
//!
//! A transaction's own buffered write for a key always wins.
//!
//! # Writes
//!
//! Every write takes the key's Exclusive lock, then evaluates its condition
//! against the latest committed record (plus the transaction's own buffered
//! write), which the lock keeps stable until commit.
//!
//! Every operation returns a [`Completion`]: it completes synchronously when
//! the lock it needs is free.

use crate::enumerator::{bound_ref, range_is_empty, KeyEnumerator, StoreEnumerator};
use crate::notification::{StoreChange, StoreChangeHandler};
use crate::operation::StoreOperation;
use crate::store_transaction::{PendingWrite, StoreTransaction};
use crate::version_chain::VersionChain;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use replistate_concurrency::{
    LockManager, LockMode, ProviderContext, SnapshotGuard, Transaction, TransactionManager,
};
use replistate_core::{
    codec, CancellationToken, Cleanup, Completion, HandlerSlot, IsolationLevel, LockingHints, Lsn,
    ReplicaRole, StateError, StateProviderId, StateProviderName, StateResult, StoreKey,
    StoreValue, TransactionId, TypeDescriptor, VersionedRecord, VersionedValue,
};
use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

pub(crate) struct StoreData<K, V> {
    pub(crate) map: BTreeMap<K, VersionChain<V>>,
    /// Keys whose newest version is live
    pub(crate) live: usize,
}

impl<K, V> Default for StoreData<K, V> {
    fn default() -> Self {
        StoreData {
            map: BTreeMap::new(),
            live: 0,
        }
    }
}

#[derive(Default)]
pub(crate) struct CheckpointState {
    /// Boundary fixed by prepare, pinned against version reclamation
    pub(crate) prepared: Option<SnapshotGuard>,
    /// Boundary of the staged file written by perform
    pub(crate) staged: Option<Lsn>,
    /// Boundary of the published checkpoint
    pub(crate) completed: Lsn,
}

/// Versioned transactional key/value store
pub struct Store<K, V> {
    pub(crate) ctx: ProviderContext,
    pub(crate) this: Weak<Store<K, V>>,
    pub(crate) data: RwLock<StoreData<K, V>>,
    locks: LockManager<K>,
    transactions: DashMap<TransactionId, Arc<StoreTransaction<K, V>>>,
    pub(crate) handler: HandlerSlot<dyn StoreChangeHandler<K, V>>,
    pub(crate) role: RwLock<ReplicaRole>,
    pub(crate) closed: AtomicBool,
    pub(crate) checkpoint: Mutex<CheckpointState>,
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Create an empty store
    pub fn new(ctx: ProviderContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Store {
            ctx,
            this: this.clone(),
            data: RwLock::new(StoreData::default()),
            locks: LockManager::new(),
            transactions: DashMap::new(),
            handler: HandlerSlot::new(),
            role: RwLock::new(ReplicaRole::None),
            closed: AtomicBool::new(false),
            checkpoint: Mutex::new(CheckpointState::default()),
        })
    }

    /// Registered name
    pub fn name(&self) -> &StateProviderName {
        &self.ctx.name
    }

    /// Registered id
    pub fn id(&self) -> StateProviderId {
        self.ctx.id
    }

    /// Descriptor the store was created from
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.ctx.descriptor
    }

    /// Transaction machinery of the replica
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.ctx.manager
    }

    /// Default timeout for lock waits
    pub fn default_timeout(&self) -> Duration {
        self.ctx.default_timeout
    }

    /// Whether the store has been closed or removed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> StateResult<()> {
        if self.is_closed() {
            Err(StateError::ProviderClosed(self.ctx.name.to_string()))
        } else {
            Ok(())
        }
    }

    fn arc(&self) -> StateResult<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| StateError::ProviderClosed(self.ctx.name.to_string()))
    }

    // ========================================================================
    // Store transactions
    // ========================================================================

    /// The store transaction for `txn`, creating and enlisting it on first use
    pub fn create_or_find_transaction(
        &self,
        txn: &Transaction,
    ) -> StateResult<Arc<StoreTransaction<K, V>>> {
        self.ensure_open()?;
        txn.ensure_active()?;
        if let Some(existing) = self.transactions.get(&txn.id()) {
            return Ok(Arc::clone(existing.value()));
        }
        let store = self.arc()?;
        match self.transactions.entry(txn.id()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let stxn = Arc::new(StoreTransaction::new(&store, txn));
                txn.enlist(stxn.clone())?;
                entry.insert(Arc::clone(&stxn));
                Ok(stxn)
            }
        }
    }

    pub(crate) fn release_transaction(&self, id: TransactionId) {
        self.transactions.remove(&id);
        self.locks.release_all(id);
    }

    /// Number of store transactions currently open against this store
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    fn check_write(
        &self,
        stxn: &StoreTransaction<K, V>,
        key: &K,
        value: Option<&V>,
    ) -> StateResult<()> {
        self.ensure_open()?;
        stxn.ensure_writable()?;
        self.ctx.limits.check_key(codec::encode(key)?.len())?;
        if let Some(value) = value {
            self.ctx.limits.check_value(codec::encode(value)?.len())?;
        }
        Ok(())
    }

    /// Take `key` for `stxn`. A grant that lands after the transaction
    /// has ended is handed back at once.
    fn lock(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        key: K,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<()>> {
        let locks = self.locks.clone();
        let stxn = Arc::clone(stxn);
        self.locks
            .acquire(stxn.id(), key, mode, timeout, cancel)
            .and_then_ok(move |()| {
                if let Err(e) = stxn.ensure_active() {
                    // The transaction ended while this call waited.
                    let released = locks.release_all(stxn.id());
                    debug!(txn = %stxn.id(), released, "Dropped late lock grant");
                    return Completion::ready(Err(e));
                }
                Completion::ready(Ok(()))
            })
    }

    /// Buffer an insert of `key`
    ///
    /// Fails with `KeyAlreadyExists` if the key holds a live value, either
    /// committed or written earlier in this transaction.
    pub fn add(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        key: K,
        value: V,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<()>> {
        let store = match self.check_write(stxn, &key, Some(&value)).and_then(|_| self.arc()) {
            Ok(store) => store,
            Err(e) => return Completion::ready(Err(e)),
        };
        let stxn = Arc::clone(stxn);
        self.lock(&stxn, key.clone(), LockMode::Exclusive, timeout, cancel)
            .and_then_ok(move |()| Completion::ready(store.buffer_add(&stxn, key, value)))
    }

    fn buffer_add(&self, stxn: &StoreTransaction<K, V>, key: K, value: V) -> StateResult<()> {
        self.ensure_open()?;
        stxn.ensure_writable()?;
        let mut writes = stxn.writes.lock();
        match writes.get_mut(&key) {
            Some(write) if write.value.is_some() => Err(StateError::KeyAlreadyExists),
            Some(write) => {
                write.value = Some(value);
                Ok(())
            }
            None => {
                if self.latest_live_version(&key).is_some() {
                    return Err(StateError::KeyAlreadyExists);
                }
                writes.insert(
                    key,
                    PendingWrite {
                        value: Some(value),
                        base: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Replace the value of `key` if it exists and matches `expected_version`
    ///
    /// Returns `false` without mutating when the key is absent or its
    /// version differs. `None` skips the version check.
    pub fn conditional_update(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        key: K,
        value: V,
        timeout: Duration,
        cancel: &CancellationToken,
        expected_version: Option<Lsn>,
    ) -> Completion<StateResult<bool>> {
        let store = match self.check_write(stxn, &key, Some(&value)).and_then(|_| self.arc()) {
            Ok(store) => store,
            Err(e) => return Completion::ready(Err(e)),
        };
        let stxn = Arc::clone(stxn);
        self.lock(&stxn, key.clone(), LockMode::Exclusive, timeout, cancel)
            .and_then_ok(move |()| {
                Completion::ready(store.buffer_conditional(&stxn, key, Some(value), expected_version))
            })
    }

    /// Remove `key` if it exists and matches `expected_version`
    ///
    /// Same contract as [`conditional_update`](Self::conditional_update);
    /// success leaves a tombstone at commit.
    pub fn conditional_remove(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        key: K,
        timeout: Duration,
        cancel: &CancellationToken,
        expected_version: Option<Lsn>,
    ) -> Completion<StateResult<bool>> {
        let store = match self.check_write(stxn, &key, None).and_then(|_| self.arc()) {
            Ok(store) => store,
            Err(e) => return Completion::ready(Err(e)),
        };
        let stxn = Arc::clone(stxn);
        self.lock(&stxn, key.clone(), LockMode::Exclusive, timeout, cancel)
            .and_then_ok(move |()| {
                Completion::ready(store.buffer_conditional(&stxn, key, None, expected_version))
            })
    }

    fn buffer_conditional(
        &self,
        stxn: &StoreTransaction<K, V>,
        key: K,
        value: Option<V>,
        expected_version: Option<Lsn>,
    ) -> StateResult<bool> {
        self.ensure_open()?;
        stxn.ensure_writable()?;
        let mut writes = stxn.writes.lock();
        let current = match writes.get(&key) {
            Some(write) => write.value.as_ref().map(|_| write.reported_version()),
            None => self.latest_live_version(&key),
        };
        let Some(current) = current else {
            return Ok(false);
        };
        if expected_version.map_or(false, |expected| expected != current) {
            return Ok(false);
        }
        match writes.get_mut(&key) {
            Some(write) => write.value = value,
            None => {
                writes.insert(
                    key,
                    PendingWrite {
                        value,
                        base: Some(current),
                    },
                );
            }
        }
        Ok(true)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn check_read(&self, stxn: &StoreTransaction<K, V>) -> StateResult<()> {
        self.ensure_open()?;
        stxn.ensure_active()
    }

    /// Read `key` under the store transaction's isolation level
    ///
    /// Returns `None` when the key is absent or removed.
    pub fn conditional_get(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        key: &K,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<Option<VersionedValue<V>>>> {
        if let Err(e) = self.check_read(stxn) {
            return Completion::ready(Err(e));
        }
        if let Some(write) = stxn.pending(key) {
            return Completion::ready(Ok(write.visible()));
        }

        let lock_mode = if stxn.locking_hints() == LockingHints::UpdateLock && !stxn.is_read_only()
        {
            Some(LockMode::Update)
        } else if stxn.read_isolation_level() == IsolationLevel::RepeatableRead {
            Some(LockMode::Shared)
        } else {
            None
        };

        let Some(mode) = lock_mode else {
            return Completion::ready(Ok(self.read_at(key, stxn.snapshot_lsn())));
        };
        let store = match self.arc() {
            Ok(store) => store,
            Err(e) => return Completion::ready(Err(e)),
        };
        let key = key.clone();
        self.lock(stxn, key.clone(), mode, timeout, cancel)
            .and_then_ok(move |()| {
                Completion::ready(store.ensure_open().map(|_| store.read_latest(&key)))
            })
    }

    /// Whether `key` holds a live value, under the same rules as
    /// [`conditional_get`](Self::conditional_get)
    pub fn contains_key(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        key: &K,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<bool>> {
        self.conditional_get(stxn, key, timeout, cancel)
            .map(|result| result.map(|found| found.is_some()))
    }

    /// Snapshot enumerator over `range`, merged with the transaction's own writes
    pub fn create_enumerator<R: RangeBounds<K>>(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        range: R,
    ) -> Completion<StateResult<StoreEnumerator<K, V>>> {
        let result = self.check_read(stxn).and_then(|_| {
            let store = self.arc()?;
            let lower = range.start_bound().cloned();
            let upper = range.end_bound().cloned();
            let own_writes = if range_is_empty(&lower, &upper) {
                BTreeMap::new()
            } else {
                stxn.writes
                    .lock()
                    .range::<K, _>((bound_ref(&lower), bound_ref(&upper)))
                    .map(|(k, w)| (k.clone(), w.visible()))
                    .collect()
            };
            let snapshot = self.manager().snapshots().register(stxn.snapshot_lsn());
            Ok(StoreEnumerator::new(store, snapshot, lower, upper, own_writes))
        });
        Completion::ready(result)
    }

    /// Snapshot key enumerator over `range`
    pub fn create_key_enumerator<R: RangeBounds<K>>(
        &self,
        stxn: &Arc<StoreTransaction<K, V>>,
        range: R,
    ) -> Completion<StateResult<KeyEnumerator<K, V>>> {
        self.create_enumerator(stxn, range)
            .map(|result| result.map(KeyEnumerator::new))
    }

    /// Enumerator over the whole committed content, outside any transaction
    pub fn snapshot_enumerator(&self) -> StateResult<StoreEnumerator<K, V>> {
        let store = self.arc()?;
        let snapshot = self.manager().acquire_snapshot();
        Ok(StoreEnumerator::new(
            store,
            snapshot,
            Bound::Unbounded,
            Bound::Unbounded,
            BTreeMap::new(),
        ))
    }

    /// Number of committed live keys; best effort
    pub fn count(&self) -> usize {
        self.data.read().live
    }

    fn latest_live_version(&self, key: &K) -> Option<Lsn> {
        let data = self.data.read();
        data.map
            .get(key)
            .and_then(|chain| chain.latest())
            .filter(|r| !r.is_tombstone())
            .map(|r| r.version)
    }

    fn read_at(&self, key: &K, lsn: Lsn) -> Option<VersionedValue<V>> {
        let data = self.data.read();
        data.map
            .get(key)
            .and_then(|chain| chain.visible_at(lsn))
            .and_then(|r| r.value().map(|v| VersionedValue::new(r.version, v.clone())))
    }

    fn read_latest(&self, key: &K) -> Option<VersionedValue<V>> {
        self.read_at(key, Lsn::new(i64::MAX))
    }

    /// First key in bounds with a live version at `lsn`
    pub(crate) fn next_visible(
        &self,
        lower: Bound<&K>,
        upper: Bound<&K>,
        lsn: Lsn,
    ) -> Option<(K, VersionedValue<V>)> {
        let data = self.data.read();
        data.map.range::<K, _>((lower, upper)).find_map(|(k, chain)| {
            chain
                .visible_at(lsn)
                .and_then(|r| r.value().map(|v| (k.clone(), VersionedValue::new(r.version, v.clone()))))
        })
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Make `operations` visible at `lsn`
    ///
    /// Operations at or below a key's newest version were already applied
    /// and are skipped, so replay is idempotent.
    pub(crate) fn apply_operations(&self, operations: &[StoreOperation<K, V>], lsn: Lsn) {
        let horizon = self.manager().gc_horizon();
        let mut data = self.data.write();
        for op in operations {
            let record = match &op.value {
                Some(value) => VersionedRecord::new(value.clone(), lsn),
                None => VersionedRecord::tombstone(lsn),
            };
            let (was_live, now_live) = match data.map.get_mut(&op.key) {
                Some(chain) => {
                    if chain.latest().map_or(false, |latest| latest.version >= lsn) {
                        continue;
                    }
                    let was_live = chain.is_live();
                    chain.push(record);
                    chain.gc(horizon);
                    (was_live, chain.is_live())
                }
                None => {
                    if record.is_tombstone() {
                        continue;
                    }
                    data.map.insert(op.key.clone(), VersionChain::new(record));
                    (false, true)
                }
            };
            match (was_live, now_live) {
                (false, true) => data.live += 1,
                (true, false) => data.live -= 1,
                _ => {}
            }
        }
    }

    /// Reclaim versions no reader can observe
    pub fn compact(&self) -> usize {
        let horizon = self.manager().gc_horizon();
        let mut data = self.data.write();
        let before = data.map.len();
        data.map.retain(|_, chain| {
            chain.gc(horizon);
            !chain.is_reclaimable(horizon)
        });
        let removed = before - data.map.len();
        if removed > 0 {
            debug!(provider = %self.ctx.id, removed, horizon = %horizon, "Reclaimed tombstones");
        }
        removed
    }

    /// Replace the content with `records`, all live
    pub(crate) fn replace_content(&self, records: Vec<(K, VersionedRecord<V>)>) {
        let mut data = self.data.write();
        data.map.clear();
        data.live = 0;
        for (key, record) in records {
            if !record.is_tombstone() {
                data.live += 1;
            }
            data.map.insert(key, VersionChain::new(record));
        }
    }

    /// Committed live records at `lsn`, in key order
    pub(crate) fn records_at(&self, lsn: Lsn) -> Vec<(K, VersionedRecord<V>)> {
        let data = self.data.read();
        data.map
            .iter()
            .filter_map(|(k, chain)| chain.visible_at(lsn).map(|r| (k.clone(), r.clone())))
            .collect()
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Register the change handler, replacing any previous one
    ///
    /// `cleanup` runs exactly once when the registration is torn down.
    pub fn set_change_handler(
        &self,
        handler: Arc<dyn StoreChangeHandler<K, V>>,
        cleanup: Option<Cleanup>,
    ) {
        self.handler.set(handler, cleanup);
    }

    /// Remove the change handler
    pub fn clear_change_handler(&self) {
        self.handler.clear();
    }

    pub(crate) fn publish_changes(
        &self,
        txn: &Transaction,
        operations: Vec<StoreOperation<K, V>>,
        lsn: Lsn,
        is_primary: bool,
    ) {
        let Some(handler) = self.handler.get() else {
            return;
        };
        for op in operations {
            handler.on_change(StoreChange {
                transaction: txn.clone(),
                kind: op.kind,
                key: op.key,
                value: op.value,
                lsn,
                is_primary,
            });
        }
    }

    pub(crate) fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let open: Vec<TransactionId> = self.transactions.iter().map(|e| *e.key()).collect();
        for id in open {
            self.release_transaction(id);
        }
        self.handler.clear();
        *self.data.write() = StoreData::default();
        info!(provider = %self.ctx.id, name = %self.ctx.name, "Store closed");
    }
}

impl<K, V> std::fmt::Debug for Store<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.ctx.id)
            .field("name", &self.ctx.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
