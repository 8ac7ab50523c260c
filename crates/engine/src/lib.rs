//! Replica engine for replistate
//!
//! This crate orchestrates all lower layers:
//! - StateManager: the transactional namespace of state providers
//! - CheckpointManager: three-phase checkpoints and checkpoint recovery
//! - BackupManager: full / incremental backups, chain restore
//! - Replica: open / recover, role changes, secondary apply, data loss
//!
//! The engine is the only component that knows about:
//! - Which concrete provider a type descriptor selects
//! - Cross-layer coordination (providers + log + checkpoint files)
//! - Replay logic

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod checkpoint;
pub mod replica;
pub mod state_manager;

pub use backup::{BackupManager, BackupSettings, BackupUploader, FolderUploader, RestorePolicy};
pub use checkpoint::CheckpointManager;
pub use replica::{
    DataLossHandler, Replica, ReplicaBuilder, ReplicaConfig, RestoreContext, CONFIG_FILE_NAME,
};
pub use state_manager::compat::CompatDictionary;
pub use state_manager::factory::{
    compat_descriptor, store_descriptor, ProviderFactories, ProviderFactory, RUST_LANG,
};
pub use state_manager::namespace::{LoggedProvider, NamespaceOperation, NamespaceTransaction};
pub use state_manager::notification::{
    NamespaceChange, NamespaceChangeKind, NamespaceEnumerator, StateManagerChangeHandler,
};
pub use state_manager::{downcast_store, StateManager};
