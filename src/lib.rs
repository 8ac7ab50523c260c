//! replistate - replicated transactional state storage
//!
//! A replica hosts a namespace of named, versioned key/value stores. Writes
//! go through transactions that are logged with a sequence number (LSN),
//! checkpointed to disk, and can be backed up and restored as full +
//! incremental chains.
//!
//! # Quick Start
//!
//! ```ignore
//! use replistate::{store_descriptor, downcast_store, Replica, ReplicaRole, StateProviderName};
//!
//! let replica = Replica::builder()
//!     .path("/data/replica")
//!     .register_store::<String, String>("String:String")
//!     .open()
//!     .await?;
//! replica.change_role(ReplicaRole::Primary).await?;
//!
//! let txn = replica.create_transaction()?;
//! let (provider, _) = replica
//!     .state_manager()
//!     .get_or_add(&txn, StateProviderName::new("fabric:/orders")?, store_descriptor("String:String"),
//!         timeout, &cancel)
//!     .await?;
//! let orders = downcast_store::<String, String>(provider)?;
//! let stxn = orders.create_or_find_transaction(&txn)?;
//! orders.add(&stxn, "o-1".into(), "pending".into(), timeout, &cancel).await?;
//! txn.commit().await?;
//! ```
//!
//! # Architecture
//!
//! - `replistate-core`: identifiers, errors, type descriptors, cancellation
//! - `replistate-durability`: log records, log files, checkpoint and backup files
//! - `replistate-concurrency`: transactions, locks, the replicator
//! - `replistate-storage`: the versioned `Store<K, V>` provider
//! - `replistate-engine`: state manager, checkpoints, backups, `Replica`

pub use replistate_concurrency::{
    Transaction, TransactionChangeHandler, TransactionManager, TransactionMetrics,
};
pub use replistate_core::{
    CancellationToken, Completion, Epoch, ErrorCategory, IsolationLevel, Limits, Lsn,
    ReplicaRole, StateError, StateProviderId, StateProviderName, StateResult, StoreKey,
    StoreValue, TypeDescriptor, VersionedValue,
};
pub use replistate_durability::{BackupInfo, BackupMetadata, BackupOption, DurabilityMode};
pub use replistate_engine::{
    downcast_store, store_descriptor, BackupUploader, DataLossHandler, FolderUploader,
    NamespaceChange, NamespaceChangeKind, NamespaceEnumerator, Replica, ReplicaBuilder,
    ReplicaConfig, RestoreContext, RestorePolicy, StateManager, StateManagerChangeHandler,
};
pub use replistate_storage::{ChangeKind, Store, StoreChange, StoreChangeHandler, StoreTransaction};

/// Lower layers, for callers that need more than the facade
pub mod layers {
    pub use replistate_concurrency as concurrency;
    pub use replistate_core as core;
    pub use replistate_durability as durability;
    pub use replistate_engine as engine;
    pub use replistate_storage as storage;
}
