//! Transaction manager
//!
//! Owns everything transactions on one replica share:
//! - transaction id allocation
//! - the commit gate (commits replicate, apply and notify one at a time)
//! - the last committed LSN, which is also the snapshot LSN for new readers
//! - the snapshot registry that bounds version garbage collection
//! - commit metrics and the transaction commit notification

use crate::replicator::TransactionalReplicator;
use crate::snapshot::{SnapshotGuard, SnapshotRegistry};
use crate::transaction::Transaction;
use replistate_core::{Cleanup, HandlerSlot, Lsn, ReplicaRole, TransactionId};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info};

/// Receives the commit notification for every committed write transaction
pub trait TransactionChangeHandler: Send + Sync {
    /// Called once per commit, after all store notifications for it
    fn on_committed(&self, txn: &Transaction, lsn: Lsn);
}

#[derive(Default)]
pub(crate) struct MetricCounters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
}

impl MetricCounters {
    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time transaction statistics
#[derive(Debug, Clone, Default)]
pub struct TransactionMetrics {
    /// Transactions neither committed, aborted nor failed
    pub active_count: u64,
    /// Transactions started
    pub total_started: u64,
    /// Transactions committed
    pub total_committed: u64,
    /// Transactions aborted
    pub total_aborted: u64,
    /// Transactions whose commit failed
    pub total_failed: u64,
    /// Committed / completed
    pub commit_rate: f64,
    /// Last committed LSN
    pub last_committed_lsn: Lsn,
}

impl TransactionMetrics {
    /// Transactions that reached a terminal state
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted + self.total_failed
    }

    /// Aborted or failed / completed
    pub fn abort_rate(&self) -> f64 {
        let completed = self.total_completed();
        if completed == 0 {
            0.0
        } else {
            (self.total_aborted + self.total_failed) as f64 / completed as f64
        }
    }
}

/// Shared transaction machinery for one replica
pub struct TransactionManager {
    replicator: Arc<dyn TransactionalReplicator>,
    commit_gate: AsyncMutex<()>,
    next_txn_id: AtomicU64,
    last_committed: AtomicI64,
    snapshots: SnapshotRegistry,
    metrics: MetricCounters,
    commit_handler: HandlerSlot<dyn TransactionChangeHandler>,
    commit_watch: watch::Sender<Lsn>,
}

impl TransactionManager {
    /// Manager committing through `replicator`
    pub fn new(replicator: Arc<dyn TransactionalReplicator>) -> Arc<Self> {
        let last = replicator.tail_lsn();
        let (commit_watch, _) = watch::channel(last);
        Arc::new(TransactionManager {
            replicator,
            commit_gate: AsyncMutex::new(()),
            next_txn_id: AtomicU64::new(1),
            last_committed: AtomicI64::new(last.as_i64()),
            snapshots: SnapshotRegistry::new(),
            metrics: MetricCounters::default(),
            commit_handler: HandlerSlot::new(),
            commit_watch,
        })
    }

    /// Replicator commits go through
    pub fn replicator(&self) -> &Arc<dyn TransactionalReplicator> {
        &self.replicator
    }

    /// Current replica role
    pub fn role(&self) -> ReplicaRole {
        self.replicator.role()
    }

    fn allocate_id(&self) -> TransactionId {
        TransactionId(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Make sure ids allocated from now on are above `id`
    pub fn observe_txn_id(&self, id: TransactionId) {
        self.next_txn_id.fetch_max(id.0 + 1, Ordering::SeqCst);
    }

    /// Start a read-write transaction
    ///
    /// On a non-primary the transaction can still read, but its commit fails
    /// with `NotPrimary`.
    pub fn create_transaction(self: &Arc<Self>) -> Transaction {
        let is_primary = self.role().is_primary();
        let txn = Transaction::new(Arc::clone(self), self.allocate_id(), is_primary, false);
        self.metrics.record_started();
        debug!(txn = %txn.id(), is_primary, "Transaction started");
        txn
    }

    /// Start a transaction that refuses writes
    pub fn create_read_only_transaction(self: &Arc<Self>) -> Transaction {
        let is_primary = self.role().is_primary();
        let txn = Transaction::new(Arc::clone(self), self.allocate_id(), is_primary, true);
        self.metrics.record_started();
        txn
    }

    /// Already-committed transaction for applying replicated or recovered work
    pub fn replicated_transaction(self: &Arc<Self>, id: TransactionId, lsn: Lsn) -> Transaction {
        self.observe_txn_id(id);
        Transaction::committed(Arc::clone(self), id, lsn)
    }

    /// Highest LSN whose effects are visible
    pub fn last_committed_lsn(&self) -> Lsn {
        Lsn::new(self.last_committed.load(Ordering::SeqCst))
    }

    pub(crate) fn advance_committed(&self, lsn: Lsn) {
        self.last_committed.fetch_max(lsn.as_i64(), Ordering::SeqCst);
        self.commit_watch.send_replace(self.last_committed_lsn());
    }

    /// Set the visible LSN after recovery or replicated apply
    pub fn set_last_committed(&self, lsn: Lsn) {
        self.advance_committed(lsn);
        info!(lsn = %lsn, "Last committed LSN set");
    }

    /// Move the visible LSN to exactly `lsn`, backwards if need be
    ///
    /// Only a restore replaces state wholesale; everything else advances.
    pub fn reset_last_committed(&self, lsn: Lsn) {
        self.last_committed.store(lsn.as_i64(), Ordering::SeqCst);
        self.commit_watch.send_replace(lsn);
        info!(lsn = %lsn, "Last committed LSN reset");
    }

    /// Register a snapshot reader at the current committed LSN
    ///
    /// A commit becomes visible only after all of its writes are applied, so
    /// the returned LSN never exposes part of a transaction.
    pub fn acquire_snapshot(&self) -> SnapshotGuard {
        self.snapshots.register_current(|| self.last_committed_lsn())
    }

    /// Oldest LSN any reader may still observe
    ///
    /// Versions superseded at or below this LSN can be reclaimed.
    pub fn gc_horizon(&self) -> Lsn {
        self.snapshots.horizon(|| self.last_committed_lsn())
    }

    /// Snapshot registry
    pub fn snapshots(&self) -> &SnapshotRegistry {
        &self.snapshots
    }

    pub(crate) fn commit_gate(&self) -> &AsyncMutex<()> {
        &self.commit_gate
    }

    /// Hold off commits until the guard drops
    ///
    /// Checkpoint preparation and replicated apply use this to observe a
    /// quiescent committed state.
    pub async fn commit_barrier(&self) -> AsyncMutexGuard<'_, ()> {
        self.commit_gate.lock().await
    }

    /// Register the transaction commit handler, replacing any previous one
    ///
    /// `cleanup` runs exactly once, when this registration is replaced or
    /// cleared or the manager is dropped.
    pub fn set_commit_handler(
        &self,
        handler: Arc<dyn TransactionChangeHandler>,
        cleanup: Option<Cleanup>,
    ) {
        self.commit_handler.set(handler, cleanup);
    }

    /// Remove the transaction commit handler
    pub fn clear_commit_handler(&self) {
        self.commit_handler.clear();
    }

    /// Fire the commit notification for `txn`
    ///
    /// The commit path calls this itself; replicated apply calls it once per
    /// applied transaction record.
    pub fn publish_commit(&self, txn: &Transaction, lsn: Lsn) {
        if let Some(handler) = self.commit_handler.get() {
            handler.on_committed(txn, lsn);
        }
    }

    /// Watch the committed LSN
    pub fn subscribe_commits(&self) -> watch::Receiver<Lsn> {
        self.commit_watch.subscribe()
    }

    pub(crate) fn metrics_handle(&self) -> &MetricCounters {
        &self.metrics
    }

    /// Snapshot of transaction statistics
    pub fn metrics(&self) -> TransactionMetrics {
        let total_started = self.metrics.started.load(Ordering::Relaxed);
        let total_committed = self.metrics.committed.load(Ordering::Relaxed);
        let total_aborted = self.metrics.aborted.load(Ordering::Relaxed);
        let total_failed = self.metrics.failed.load(Ordering::Relaxed);
        let completed = total_committed + total_aborted + total_failed;
        let commit_rate = if completed == 0 {
            0.0
        } else {
            total_committed as f64 / completed as f64
        };
        TransactionMetrics {
            active_count: total_started.saturating_sub(completed),
            total_started,
            total_committed,
            total_aborted,
            total_failed,
            commit_rate,
            last_committed_lsn: self.last_committed_lsn(),
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("role", &self.role())
            .field("last_committed", &self.last_committed_lsn())
            .finish()
    }
}
