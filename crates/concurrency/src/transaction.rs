//! Transaction: the atomic unit across stores and the state manager
//!
//! ## State machine
//!
//! ```text
//! Active --commit()--> CommitRequested --> Committed(lsn)
//!    |                         |
//!    +--abort()/drop--> Aborted +--failure--> Faulted
//! ```
//!
//! Terminal states never change again. A transaction handle is cheap to
//! clone; dropping the last handle of an active transaction aborts it.
//!
//! ## Commit sequence
//!
//! 1. Reject non-primary transactions with `NotPrimary`
//! 2. Take the manager's commit gate (serializes commits and notifications)
//! 3. Check the replicator's write status
//! 4. Collect every participant's operations into one replication unit
//! 5. Replicate: the single point where the commit LSN is assigned
//! 6. Apply every participant's operations at that LSN
//! 7. Release every lock
//! 8. Publish change notifications, participants in the order they enlisted
//! 9. Fire the transaction commit notification
//!
//! Any failure before step 6 releases everything and leaves no trace. So
//! does dropping the commit future before it completes: the transaction
//! ends `Faulted` with its locks released.

use crate::manager::TransactionManager;
use crate::participant::TransactionParticipant;
use parking_lot::Mutex;
use replistate_core::{IsolationLevel, Lsn, StateError, StateResult, TransactionId};
use replistate_durability::ProviderOperation;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations
    Active,
    /// Commit in progress
    CommitRequested,
    /// Committed at the given LSN
    Committed(Lsn),
    /// Aborted by the caller; nothing was applied
    Aborted,
    /// Commit failed; nothing was applied unless the error is fatal
    Faulted,
}

impl TransactionState {
    /// Whether the transaction can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed(_) | TransactionState::Aborted | TransactionState::Faulted
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "Active"),
            TransactionState::CommitRequested => write!(f, "CommitRequested"),
            TransactionState::Committed(lsn) => write!(f, "Committed({})", lsn),
            TransactionState::Aborted => write!(f, "Aborted"),
            TransactionState::Faulted => write!(f, "Faulted"),
        }
    }
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    is_primary: bool,
    read_only: bool,
    state: Mutex<TransactionState>,
    participants: Mutex<Vec<Arc<dyn TransactionParticipant>>>,
    manager: Arc<TransactionManager>,
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        if *self.state.get_mut() == TransactionState::Active {
            *self.state.get_mut() = TransactionState::Aborted;
            for participant in self.participants.get_mut().drain(..) {
                participant.release();
            }
            self.manager.metrics_handle().record_aborted();
            debug!(txn = %self.id, "Active transaction dropped, aborted");
        }
    }
}

/// Handle to a transaction
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

/// Non-owning reference to a transaction
#[derive(Clone)]
pub struct WeakTransaction {
    inner: Weak<TransactionInner>,
    id: TransactionId,
}

impl WeakTransaction {
    /// The transaction, if some handle to it is still alive
    pub fn upgrade(&self) -> Option<Transaction> {
        self.inner.upgrade().map(|inner| Transaction { inner })
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

impl Transaction {
    pub(crate) fn new(
        manager: Arc<TransactionManager>,
        id: TransactionId,
        is_primary: bool,
        read_only: bool,
    ) -> Self {
        Transaction {
            inner: Arc::new(TransactionInner {
                id,
                is_primary,
                read_only,
                state: Mutex::new(TransactionState::Active),
                participants: Mutex::new(Vec::new()),
                manager,
            }),
        }
    }

    pub(crate) fn committed(manager: Arc<TransactionManager>, id: TransactionId, lsn: Lsn) -> Self {
        Transaction {
            inner: Arc::new(TransactionInner {
                id,
                is_primary: false,
                read_only: false,
                state: Mutex::new(TransactionState::Committed(lsn)),
                participants: Mutex::new(Vec::new()),
                manager,
            }),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Whether the transaction was created on a primary
    pub fn is_primary(&self) -> bool {
        self.inner.is_primary
    }

    /// Whether writes are refused
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    /// Commit LSN, once committed
    pub fn commit_lsn(&self) -> Option<Lsn> {
        match self.state() {
            TransactionState::Committed(lsn) => Some(lsn),
            _ => None,
        }
    }

    /// Whether operations are still accepted
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Fail unless the transaction is active
    pub fn ensure_active(&self) -> StateResult<()> {
        let state = self.state();
        if state == TransactionState::Active {
            Ok(())
        } else {
            Err(StateError::TransactionNotActive {
                state: state.to_string(),
            })
        }
    }

    /// Fail unless the transaction is active and writable
    pub fn ensure_writable(&self) -> StateResult<()> {
        self.ensure_active()?;
        if self.inner.read_only {
            return Err(StateError::ReadOnlyTransaction);
        }
        Ok(())
    }

    /// Default read isolation for single-key reads
    pub fn default_isolation(&self) -> IsolationLevel {
        IsolationLevel::default_for(self.inner.is_primary, self.inner.read_only)
    }

    /// Manager this transaction belongs to
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.inner.manager
    }

    /// Non-owning reference for participants
    pub fn downgrade(&self) -> WeakTransaction {
        WeakTransaction {
            inner: Arc::downgrade(&self.inner),
            id: self.inner.id,
        }
    }

    /// Enlist a participant; commit and abort drive it from now on
    pub fn enlist(&self, participant: Arc<dyn TransactionParticipant>) -> StateResult<()> {
        let state = self.inner.state.lock();
        if *state != TransactionState::Active {
            return Err(StateError::TransactionNotActive {
                state: state.to_string(),
            });
        }
        self.inner.participants.lock().push(participant);
        Ok(())
    }

    /// Number of enlisted participants
    pub fn participant_count(&self) -> usize {
        self.inner.participants.lock().len()
    }

    fn begin_commit(&self) -> StateResult<Vec<Arc<dyn TransactionParticipant>>> {
        let mut state = self.inner.state.lock();
        if *state != TransactionState::Active {
            return Err(StateError::TransactionNotActive {
                state: state.to_string(),
            });
        }
        *state = TransactionState::CommitRequested;
        Ok(std::mem::take(&mut *self.inner.participants.lock()))
    }

    fn set_state(&self, state: TransactionState) {
        *self.inner.state.lock() = state;
    }

    fn fail(&self, participants: &[Arc<dyn TransactionParticipant>], err: StateError) -> StateError {
        for participant in participants {
            participant.release();
        }
        self.set_state(TransactionState::Faulted);
        self.inner.manager.metrics_handle().record_failed();
        warn!(txn = %self.inner.id, error = %err, "Transaction commit failed");
        err
    }

    /// Commit the transaction
    ///
    /// Returns the commit LSN. A transaction that buffered no writes commits
    /// without replication and reports the last committed LSN.
    pub async fn commit(&self) -> StateResult<Lsn> {
        let mut pending = CommitInFlight {
            txn: self,
            participants: self.begin_commit()?,
            settled: false,
        };
        let manager = Arc::clone(&self.inner.manager);

        if self.inner.read_only {
            pending.settled = true;
            for participant in &pending.participants {
                participant.release();
            }
            let lsn = manager.last_committed_lsn();
            self.set_state(TransactionState::Committed(lsn));
            manager.metrics_handle().record_committed();
            return Ok(lsn);
        }
        if !self.inner.is_primary {
            pending.settled = true;
            return Err(self.fail(&pending.participants, StateError::NotPrimary));
        }

        let _gate = manager.commit_gate().lock().await;
        let result = self.commit_locked(&manager, &pending.participants).await;
        pending.settled = true;
        result.map_err(|e| self.fail(&pending.participants, e))
    }

    async fn commit_locked(
        &self,
        manager: &Arc<TransactionManager>,
        participants: &[Arc<dyn TransactionParticipant>],
    ) -> StateResult<Lsn> {
        manager.replicator().write_status().check()?;

        let mut operations = Vec::with_capacity(participants.len());
        for participant in participants {
            if let Some(payload) = participant.collect_operations()? {
                operations.push(ProviderOperation::new(participant.provider_id(), payload));
            }
        }

        if operations.is_empty() {
            for participant in participants {
                participant.release();
            }
            let lsn = manager.last_committed_lsn();
            self.set_state(TransactionState::Committed(lsn));
            manager.metrics_handle().record_committed();
            debug!(txn = %self.inner.id, "Committed without writes");
            return Ok(lsn);
        }

        let lsn = manager.replicator().replicate(self.inner.id, operations).await?;

        for participant in participants {
            if let Err(e) = participant.apply_committed(lsn) {
                error!(
                    txn = %self.inner.id,
                    lsn = %lsn,
                    provider = %participant.provider_id(),
                    error = %e,
                    "Applying a durable commit failed"
                );
                return Err(e);
            }
        }
        manager.advance_committed(lsn);
        self.set_state(TransactionState::Committed(lsn));

        for participant in participants {
            participant.unlock();
        }
        for participant in participants {
            participant.publish_notifications(self, lsn);
        }
        manager.publish_commit(self, lsn);
        manager.metrics_handle().record_committed();

        debug!(txn = %self.inner.id, lsn = %lsn, "Transaction committed");
        Ok(lsn)
    }

    /// Abort the transaction
    ///
    /// Discards buffered operations and releases locks; no notification
    /// fires. A no-op once the transaction has left the active state.
    pub fn abort(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != TransactionState::Active {
                return;
            }
            *state = TransactionState::Aborted;
        }
        let participants = std::mem::take(&mut *self.inner.participants.lock());
        for participant in &participants {
            participant.release();
        }
        self.inner.manager.metrics_handle().record_aborted();
        debug!(txn = %self.inner.id, participants = participants.len(), "Transaction aborted");
    }
}

/// Participants taken by a commit that has not finished
///
/// Dropping the commit future before it settles faults the transaction and
/// releases everything it held.
struct CommitInFlight<'a> {
    txn: &'a Transaction,
    participants: Vec<Arc<dyn TransactionParticipant>>,
    settled: bool,
}

impl Drop for CommitInFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.txn.fail(&self.participants, StateError::OperationCanceled);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("is_primary", &self.inner.is_primary)
            .field("read_only", &self.inner.read_only)
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}
