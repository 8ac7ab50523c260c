//! Storage layer for replistate
//!
//! This crate implements the versioned store with:
//! - Store: MVCC key/value collection over version chains
//! - StoreTransaction: per-store view of a transaction (buffered writes,
//!   isolation level, locking hints)
//! - Snapshot enumerators merged with the transaction's own writes
//! - Store operations wire format shared by commit, recovery and secondary apply
//! - Change notifications, including the rebuild notification
//! - Checkpoint, recovery and replay as a state provider

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod enumerator;
pub mod notification;
pub mod operation;
pub mod provider;
pub mod store;
pub mod store_transaction;
pub mod version_chain;

pub use enumerator::{KeyEnumerator, StoreEnumerator};
pub use notification::{StoreChange, StoreChangeHandler};
pub use operation::{decode_operations, encode_operations, ChangeKind, StoreOperation};
pub use store::Store;
pub use store_transaction::StoreTransaction;
pub use version_chain::VersionChain;
