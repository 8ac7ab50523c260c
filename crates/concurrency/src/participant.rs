//! Transaction participants
//!
//! Anything that buffers work inside a [`Transaction`] (a store transaction,
//! the state manager's namespace changes) enlists as a participant. The
//! commit path drives every participant through the same sequence:
//!
//! ```text
//! collect_operations -> (replicate) -> apply_committed -> unlock -> publish_notifications
//! ```
//!
//! and the abort path calls only `release`.

use crate::transaction::Transaction;
use replistate_core::{Lsn, StateProviderId, StateResult};

/// Work buffered by one provider inside one transaction
pub trait TransactionParticipant: Send + Sync {
    /// Provider the buffered operations belong to
    fn provider_id(&self) -> StateProviderId;

    /// Encode the buffered operations as one log payload
    ///
    /// `None` when there is nothing to log (reads only, or writes that
    /// cancelled each other out).
    fn collect_operations(&self) -> StateResult<Option<Vec<u8>>>;

    /// Make the buffered operations visible at `lsn`
    fn apply_committed(&self, lsn: Lsn) -> StateResult<()>;

    /// Release locks after a successful commit
    fn unlock(&self);

    /// Deliver change notifications for what was applied
    fn publish_notifications(&self, txn: &Transaction, lsn: Lsn);

    /// Discard buffered operations and release locks (abort or failed commit)
    fn release(&self);
}
