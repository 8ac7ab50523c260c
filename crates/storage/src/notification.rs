//! Store change notifications
//!
//! A store holds at most one [`StoreChangeHandler`]. Per-key events fire
//! once per committed operation, after the commit is durable and in key
//! order within the transaction. A rebuild hands the handler an enumerator
//! over the whole store instead.

use crate::enumerator::StoreEnumerator;
use crate::operation::ChangeKind;
use replistate_concurrency::Transaction;
use replistate_core::Lsn;

/// One committed change to one key
#[derive(Debug, Clone)]
pub struct StoreChange<K, V> {
    /// Transaction that committed the change
    pub transaction: Transaction,
    /// Add, update or remove
    pub kind: ChangeKind,
    /// The key
    pub key: K,
    /// The new value; `None` for removes
    pub value: Option<V>,
    /// Commit LSN, also the key's new version
    pub lsn: Lsn,
    /// Whether the change was committed on this replica as primary
    pub is_primary: bool,
}

/// Receives a store's change notifications
pub trait StoreChangeHandler<K, V>: Send + Sync {
    /// A committed add, update or remove
    fn on_change(&self, change: StoreChange<K, V>);

    /// The store's content was re-materialized (recovery, restore)
    ///
    /// `contents` yields every live key with its version and value.
    fn on_rebuilt(&self, contents: StoreEnumerator<K, V>);
}
