//! Store transaction: one store's view of one transaction
//!
//! Created on first touch of a store inside a transaction and reused for
//! every later touch. It buffers the transaction's writes to that store,
//! carries the read isolation level and locking hints, and is enlisted in
//! the transaction as a participant so commit and abort reach it.
//!
//! # Buffered writes
//!
//! Writes are kept per key as the final value plus the version of the
//! committed record they replace. At commit they collapse to one operation
//! per key:
//!
//! | replaced record | final value | logged as |
//! |-----------------|-------------|-----------|
//! | none            | some        | Add       |
//! | some            | some        | Update    |
//! | some            | none        | Remove    |
//! | none            | none        | nothing   |
//!
//! Own uncommitted writes report the version of the record they replace
//! (`Lsn::INVALID` for keys new to the store).

use crate::operation::{encode_operations, StoreOperation};
use crate::store::Store;
use parking_lot::Mutex;
use replistate_concurrency::{SnapshotGuard, Transaction, TransactionParticipant, WeakTransaction};
use replistate_core::{
    IsolationLevel, LockingHints, Lsn, StateError, StateProviderId, StateResult, StoreKey,
    StoreValue, TransactionId, VersionedValue,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// A buffered write to one key
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite<V> {
    /// Final value, `None` once removed
    pub(crate) value: Option<V>,
    /// Version of the committed live record this write replaces
    pub(crate) base: Option<Lsn>,
}

impl<V: Clone> PendingWrite<V> {
    /// Version reported to readers of the buffered write
    pub(crate) fn reported_version(&self) -> Lsn {
        self.base.unwrap_or(Lsn::INVALID)
    }

    pub(crate) fn visible(&self) -> Option<VersionedValue<V>> {
        self.value
            .as_ref()
            .map(|v| VersionedValue::new(self.reported_version(), v.clone()))
    }
}

/// Per-store view of a transaction
pub struct StoreTransaction<K, V> {
    txn: WeakTransaction,
    provider_id: StateProviderId,
    store: Weak<Store<K, V>>,
    read_only: bool,
    isolation: Mutex<IsolationLevel>,
    hints: Mutex<LockingHints>,
    snapshot_lsn: Lsn,
    snapshot: Mutex<Option<SnapshotGuard>>,
    pub(crate) writes: Mutex<BTreeMap<K, PendingWrite<V>>>,
    prepared: Mutex<Vec<StoreOperation<K, V>>>,
}

impl<K: StoreKey, V: StoreValue> StoreTransaction<K, V> {
    pub(crate) fn new(store: &Arc<Store<K, V>>, txn: &Transaction) -> Self {
        let snapshot = txn.manager().acquire_snapshot();
        StoreTransaction {
            txn: txn.downgrade(),
            provider_id: store.id(),
            store: Arc::downgrade(store),
            read_only: txn.is_read_only(),
            isolation: Mutex::new(txn.default_isolation()),
            hints: Mutex::new(LockingHints::None),
            snapshot_lsn: snapshot.lsn(),
            snapshot: Mutex::new(Some(snapshot)),
            writes: Mutex::new(BTreeMap::new()),
            prepared: Mutex::new(Vec::new()),
        }
    }

    /// Id of the owning transaction
    pub fn id(&self) -> TransactionId {
        self.txn.id()
    }

    /// The owning transaction, while some handle to it is alive
    pub fn transaction(&self) -> Option<Transaction> {
        self.txn.upgrade()
    }

    /// Isolation level for single-key reads
    pub fn read_isolation_level(&self) -> IsolationLevel {
        *self.isolation.lock()
    }

    /// Override the isolation level for single-key reads
    pub fn set_read_isolation_level(&self, level: IsolationLevel) {
        *self.isolation.lock() = level;
    }

    /// Locking hints for reads
    pub fn locking_hints(&self) -> LockingHints {
        *self.hints.lock()
    }

    /// Override the locking hints for reads
    pub fn set_locking_hints(&self, hints: LockingHints) {
        *self.hints.lock() = hints;
    }

    /// LSN snapshot reads observe
    pub fn snapshot_lsn(&self) -> Lsn {
        self.snapshot_lsn
    }

    /// Whether the transaction refuses writes
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether any write is buffered
    pub fn has_writes(&self) -> bool {
        !self.writes.lock().is_empty()
    }

    pub(crate) fn ensure_active(&self) -> StateResult<()> {
        match self.txn.upgrade() {
            Some(txn) => txn.ensure_active(),
            None => Err(StateError::TransactionNotActive {
                state: "Disposed".to_string(),
            }),
        }
    }

    pub(crate) fn ensure_writable(&self) -> StateResult<()> {
        match self.txn.upgrade() {
            Some(txn) => txn.ensure_writable(),
            None => Err(StateError::TransactionNotActive {
                state: "Disposed".to_string(),
            }),
        }
    }

    /// The buffered write for `key`, if any
    pub(crate) fn pending(&self, key: &K) -> Option<PendingWrite<V>> {
        self.writes.lock().get(key).cloned()
    }

    /// Collapse buffered writes to logged operations, in key order
    fn operations(&self) -> Vec<StoreOperation<K, V>> {
        self.writes
            .lock()
            .iter()
            .filter_map(|(key, write)| match (&write.value, write.base) {
                (Some(value), None) => Some(StoreOperation::add(key.clone(), value.clone())),
                (Some(value), Some(_)) => Some(StoreOperation::update(key.clone(), value.clone())),
                (None, Some(_)) => Some(StoreOperation::remove(key.clone())),
                (None, None) => None,
            })
            .collect()
    }

    fn finish(&self) {
        self.snapshot.lock().take();
        if let Some(store) = self.store.upgrade() {
            store.release_transaction(self.id());
        }
    }
}

impl<K: StoreKey, V: StoreValue> TransactionParticipant for StoreTransaction<K, V> {
    fn provider_id(&self) -> StateProviderId {
        self.provider_id
    }

    fn collect_operations(&self) -> StateResult<Option<Vec<u8>>> {
        let operations = self.operations();
        if operations.is_empty() {
            return Ok(None);
        }
        match self.store.upgrade() {
            Some(store) if !store.is_closed() => {}
            _ => return Err(StateError::ProviderClosed(self.provider_id.to_string())),
        }
        let payload = encode_operations(&operations)?;
        trace!(
            txn = %self.id(),
            provider = %self.provider_id,
            operations = operations.len(),
            "Store operations collected"
        );
        *self.prepared.lock() = operations;
        Ok(Some(payload))
    }

    fn apply_committed(&self, lsn: Lsn) -> StateResult<()> {
        let Some(store) = self.store.upgrade() else {
            return Err(StateError::ProviderClosed(self.provider_id.to_string()));
        };
        let prepared = self.prepared.lock();
        store.apply_operations(&prepared, lsn);
        Ok(())
    }

    fn unlock(&self) {
        self.finish();
    }

    fn publish_notifications(&self, txn: &Transaction, lsn: Lsn) {
        let operations = std::mem::take(&mut *self.prepared.lock());
        self.writes.lock().clear();
        if let Some(store) = self.store.upgrade() {
            store.publish_changes(txn, operations, lsn, true);
        }
    }

    fn release(&self) {
        self.writes.lock().clear();
        self.prepared.lock().clear();
        self.finish();
    }
}

impl<K, V> std::fmt::Debug for StoreTransaction<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("txn", &self.txn.id())
            .field("provider", &self.provider_id)
            .field("snapshot_lsn", &self.snapshot_lsn)
            .field("isolation", &*self.isolation.lock())
            .finish()
    }
}
