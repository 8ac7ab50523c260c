//! Durability layer for replistate
//!
//! This crate handles everything that touches disk:
//!
//! - Log: append-only record of committed transactions, with durability modes
//! - Log record framing with CRC32 checksums
//! - Checkpoint files: per-provider record runs and state manager metadata
//! - Backup folders: metadata, checkpoint copies, log ranges, chain validation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod checkpoint_file;
pub mod encoding;
pub mod log_record;
pub mod wal;

pub use backup::{
    load_chain, order_chain, BackupChain, BackupInfo, BackupLayout, BackupMetadata, BackupOption,
};
pub use checkpoint_file::{
    publish, read_metadata_checkpoint, read_provider_checkpoint, write_metadata_checkpoint,
    write_provider_checkpoint, CheckpointLayout, CheckpointRecord, MetadataCheckpoint,
    MetadataEntry, ProviderCheckpoint,
};
pub use encoding::{decode_record, encode_record};
pub use log_record::{LogRecord, LogSummary, ProviderOperation};
pub use wal::{DurabilityMode, FileLog, LogStore, MemoryLog};
