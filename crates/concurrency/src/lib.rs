//! Transaction machinery for replistate
//!
//! This crate implements the commit path shared by every state provider:
//! - LockManager: transaction-scoped Shared / Update / Exclusive locks
//! - Transaction: state machine driving enlisted participants
//! - TransactionManager: commit gate, LSN visibility, metrics, commit notification
//! - TransactionalReplicator: the seam to the replication layer
//! - StateProvider: capability traits composed by every provider

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock_manager;
pub mod manager;
pub mod participant;
pub mod provider;
pub mod replicator;
pub mod snapshot;
pub mod transaction;

pub use lock_manager::{LockManager, LockMode};
pub use manager::{TransactionChangeHandler, TransactionManager, TransactionMetrics};
pub use participant::TransactionParticipant;
pub use provider::{
    ApplyContext, ChangeNotifier, Checkpointable, ProviderContext, ProviderLifecycle,
    ReplicatedApply, StateProvider,
};
pub use replicator::{LoggingReplicator, TransactionalReplicator, WriteStatus};
pub use snapshot::{SnapshotGuard, SnapshotRegistry};
pub use transaction::{Transaction, TransactionState, WeakTransaction};
