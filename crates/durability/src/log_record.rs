//! Replicated log records
//!
//! One `Transaction` record per committed transaction carries every
//! provider's buffered operations under the transaction's single commit
//! LSN. The remaining variants are bookkeeping markers the replica writes
//! for itself.

use replistate_core::{Epoch, Lsn, StateProviderId, TransactionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation buffered by one state provider, opaque to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOperation {
    /// Provider that produced and will apply the operation
    pub provider_id: StateProviderId,
    /// Provider-specific encoded operation
    pub payload: Vec<u8>,
}

impl ProviderOperation {
    /// Create an operation for `provider_id`
    pub fn new(provider_id: StateProviderId, payload: Vec<u8>) -> Self {
        ProviderOperation {
            provider_id,
            payload,
        }
    }
}

/// Log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A committed transaction
    Transaction {
        /// Transaction identifier
        txn_id: TransactionId,
        /// Commit LSN shared by every operation below
        lsn: Lsn,
        /// Epoch in which the transaction committed
        epoch: Epoch,
        /// Operations in participant order
        operations: Vec<ProviderOperation>,
    },

    /// The replica entered a new epoch; `lsn` is the tail at that moment
    UpdateEpoch {
        /// New epoch
        epoch: Epoch,
        /// Tail LSN when the epoch started
        lsn: Lsn,
    },

    /// A checkpoint at `lsn` became the recovery baseline
    Checkpoint {
        /// Checkpoint boundary
        lsn: Lsn,
    },

    /// A backup covering everything up to `lsn` completed
    Backup {
        /// Backup identifier
        backup_id: Uuid,
        /// Epoch of the last record covered
        epoch: Epoch,
        /// Last LSN covered
        lsn: Lsn,
    },

    /// Everything at or below `lsn` has been removed from this log
    TruncateHead {
        /// Highest LSN removed
        lsn: Lsn,
    },
}

impl LogRecord {
    /// LSN the record is ordered by
    pub fn lsn(&self) -> Lsn {
        match self {
            LogRecord::Transaction { lsn, .. }
            | LogRecord::UpdateEpoch { lsn, .. }
            | LogRecord::Checkpoint { lsn }
            | LogRecord::Backup { lsn, .. }
            | LogRecord::TruncateHead { lsn } => *lsn,
        }
    }

    /// Whether this record carries user or namespace operations
    pub fn is_transaction(&self) -> bool {
        matches!(self, LogRecord::Transaction { .. })
    }

    /// Short name used in traces
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Transaction { .. } => "transaction",
            LogRecord::UpdateEpoch { .. } => "update_epoch",
            LogRecord::Checkpoint { .. } => "checkpoint",
            LogRecord::Backup { .. } => "backup",
            LogRecord::TruncateHead { .. } => "truncate_head",
        }
    }
}

/// Summary of a log's bookkeeping markers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSummary {
    /// Highest transaction LSN in the log
    pub tail_lsn: Option<Lsn>,
    /// Latest epoch marker
    pub epoch: Option<Epoch>,
    /// Latest completed backup
    pub last_backup: Option<(Uuid, Epoch, Lsn)>,
    /// Highest truncated LSN
    pub truncated_through: Lsn,
    /// Latest completed checkpoint
    pub last_checkpoint: Option<Lsn>,
}

impl LogSummary {
    /// Scan `records` in log order
    pub fn scan<'a>(records: impl IntoIterator<Item = &'a LogRecord>) -> Self {
        let mut summary = LogSummary::default();
        for record in records {
            match record {
                LogRecord::Transaction { lsn, .. } => {
                    summary.tail_lsn = Some(summary.tail_lsn.map_or(*lsn, |t| t.max(*lsn)));
                }
                LogRecord::UpdateEpoch { epoch, .. } => summary.epoch = Some(*epoch),
                LogRecord::Checkpoint { lsn } => summary.last_checkpoint = Some(*lsn),
                LogRecord::Backup {
                    backup_id,
                    epoch,
                    lsn,
                } => summary.last_backup = Some((*backup_id, *epoch, *lsn)),
                LogRecord::TruncateHead { lsn } => {
                    summary.truncated_through = summary.truncated_through.max(*lsn)
                }
            }
        }
        summary
    }
}

/// Records that survive removing everything at or below `up_to`
///
/// The newest epoch, backup and checkpoint markers are kept even when they
/// fall below the cut, so the log alone still answers "which epoch" and
/// "which backup came last".
pub fn retain_after(records: Vec<LogRecord>, up_to: Lsn) -> Vec<LogRecord> {
    let summary = LogSummary::scan(&records);
    let mut kept = vec![LogRecord::TruncateHead { lsn: up_to }];

    if let Some(epoch) = summary.epoch {
        let marker = records
            .iter()
            .rev()
            .find(|r| matches!(r, LogRecord::UpdateEpoch { epoch: e, .. } if *e == epoch));
        if let Some(marker) = marker.filter(|m| m.lsn() <= up_to) {
            kept.push(marker.clone());
        }
    }
    if let Some((backup_id, epoch, lsn)) = summary.last_backup.filter(|(_, _, lsn)| *lsn <= up_to) {
        kept.push(LogRecord::Backup {
            backup_id,
            epoch,
            lsn,
        });
    }
    if let Some(lsn) = summary.last_checkpoint.filter(|lsn| *lsn <= up_to) {
        kept.push(LogRecord::Checkpoint { lsn });
    }

    kept.extend(
        records
            .into_iter()
            .filter(|r| !matches!(r, LogRecord::TruncateHead { .. }) && r.lsn() > up_to),
    );
    kept
}
