//! Core types for replistate
//!
//! This crate defines the foundational types used throughout the system:
//! - Lsn, Epoch: commit ordering and reconfiguration eras
//! - StateProviderName, StateProviderId, TransactionId: identities
//! - VersionedRecord: a value plus the LSN that made it visible
//! - IsolationLevel, LockingHints: read semantics of a store transaction
//! - Completion: dual-path (synchronous or suspended) operation result
//! - CancellationToken: cooperative cancellation with deadlines
//! - TypeDescriptor: self-describing state provider type strings
//! - HandlerSlot: notification handler registration with cleanup
//! - StateError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod codec;
pub mod completion;
pub mod error;
pub mod isolation;
pub mod limits;
pub mod notify;
pub mod record;
pub mod type_descriptor;
pub mod types;

pub use cancel::{with_deadline, CancellationToken, DEFAULT_TIMEOUT};
pub use codec::{StoreKey, StoreValue};
pub use completion::Completion;
pub use error::{ErrorCategory, StateError, StateResult};
pub use isolation::{IsolationLevel, LockingHints};
pub use limits::Limits;
pub use notify::{Cleanup, HandlerSlot};
pub use record::{VersionedRecord, VersionedValue};
pub use type_descriptor::{StateProviderKind, TypeDescriptor};
pub use types::{Epoch, Lsn, ReplicaRole, StateProviderId, StateProviderName, TransactionId};
