//! Replicator seam
//!
//! The replication protocol itself (quorum acknowledgement, log shipping,
//! leader election) lives outside this workspace. Transactions see it only
//! through [`TransactionalReplicator`]: something that reports role, epoch
//! and write status, and turns a transaction's operations into a durable
//! commit LSN.
//!
//! [`LoggingReplicator`] is the single-replica implementation: a commit is
//! durable once its record is in the local log.

use async_trait::async_trait;
use parking_lot::RwLock;
use replistate_core::{Epoch, Lsn, ReplicaRole, StateError, StateResult, TransactionId};
use replistate_durability::{LogRecord, LogStore, ProviderOperation};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Whether the replica may accept writes right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Writes are accepted
    Granted,
    /// The replica is not primary
    NotPrimary,
    /// Primary, but the reconfiguration that made it so is still in flight
    ReconfigurationPending,
}

impl WriteStatus {
    /// Map a non-granted status to its error
    pub fn check(self) -> StateResult<()> {
        match self {
            WriteStatus::Granted => Ok(()),
            WriteStatus::NotPrimary => Err(StateError::NotPrimary),
            WriteStatus::ReconfigurationPending => Err(StateError::ReconfigurationPending),
        }
    }
}

/// Replication layer as seen by transactions
#[async_trait]
pub trait TransactionalReplicator: Send + Sync {
    /// Current role
    fn role(&self) -> ReplicaRole;

    /// Current write status
    fn write_status(&self) -> WriteStatus;

    /// Current epoch
    fn epoch(&self) -> Epoch;

    /// Highest LSN assigned so far
    fn tail_lsn(&self) -> Lsn;

    /// Make `operations` durable as one unit and return its commit LSN
    async fn replicate(
        &self,
        txn_id: TransactionId,
        operations: Vec<ProviderOperation>,
    ) -> StateResult<Lsn>;
}

/// Replicator that makes commits durable in a local log
pub struct LoggingReplicator {
    log: Arc<dyn LogStore>,
    role: RwLock<ReplicaRole>,
    write_status: RwLock<WriteStatus>,
    epoch: RwLock<Epoch>,
    tail: AtomicI64,
}

impl LoggingReplicator {
    /// Replicator over `log`, starting with no role
    pub fn new(log: Arc<dyn LogStore>) -> Self {
        LoggingReplicator {
            log,
            role: RwLock::new(ReplicaRole::None),
            write_status: RwLock::new(WriteStatus::NotPrimary),
            epoch: RwLock::new(Epoch::default()),
            tail: AtomicI64::new(0),
        }
    }

    /// Underlying log
    pub fn log(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    /// Change role; primaries get write access immediately
    pub fn set_role(&self, role: ReplicaRole) {
        *self.role.write() = role;
        *self.write_status.write() = if role.is_primary() {
            WriteStatus::Granted
        } else {
            WriteStatus::NotPrimary
        };
        info!(?role, "Replicator role changed");
    }

    /// Override the write status (reconfiguration in flight)
    pub fn set_write_status(&self, status: WriteStatus) {
        *self.write_status.write() = status;
    }

    /// Adopt `epoch` and log the change
    pub fn update_epoch(&self, epoch: Epoch) -> StateResult<()> {
        let current = *self.epoch.read();
        if epoch < current {
            return Err(StateError::invalid_operation(format!(
                "epoch {} is older than current epoch {}",
                epoch, current
            )));
        }
        if epoch == current {
            return Ok(());
        }
        self.log.append(&LogRecord::UpdateEpoch {
            epoch,
            lsn: self.tail_lsn(),
        })?;
        *self.epoch.write() = epoch;
        info!(%epoch, "Epoch updated");
        Ok(())
    }

    /// Restore epoch and tail after recovery, without logging
    pub fn restore_position(&self, epoch: Epoch, tail: Lsn) {
        *self.epoch.write() = epoch;
        self.tail.store(tail.as_i64(), Ordering::SeqCst);
    }

    /// Append a record received from the primary and advance the tail
    pub fn append_replicated(&self, record: &LogRecord) -> StateResult<()> {
        let lsn = record.lsn();
        if record.is_transaction() && lsn <= self.tail_lsn() {
            return Err(StateError::invalid_operation(format!(
                "replicated record at {} is not after tail {}",
                lsn,
                self.tail_lsn()
            )));
        }
        self.log.append(record)?;
        if let LogRecord::UpdateEpoch { epoch, .. } = record {
            *self.epoch.write() = *epoch;
        }
        if record.is_transaction() {
            self.tail.store(lsn.as_i64(), Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalReplicator for LoggingReplicator {
    fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    fn write_status(&self) -> WriteStatus {
        *self.write_status.read()
    }

    fn epoch(&self) -> Epoch {
        *self.epoch.read()
    }

    fn tail_lsn(&self) -> Lsn {
        Lsn::new(self.tail.load(Ordering::SeqCst))
    }

    async fn replicate(
        &self,
        txn_id: TransactionId,
        operations: Vec<ProviderOperation>,
    ) -> StateResult<Lsn> {
        self.write_status().check()?;
        let lsn = self.tail_lsn().next();
        let record = LogRecord::Transaction {
            txn_id,
            lsn,
            epoch: self.epoch(),
            operations,
        };
        self.log
            .append(&record)
            .map_err(|e| StateError::ReplicationFailed(e.to_string()))?;
        self.tail.store(lsn.as_i64(), Ordering::SeqCst);
        debug!(txn = %txn_id, lsn = %lsn, "Transaction replicated");
        Ok(lsn)
    }
}
