//! Log record encoding and decoding
//!
//! This module provides encoding/decoding for log records with CRC32 checksums
//! for corruption detection.
//!
//! ## Record Format
//!
//! ```text
//! [length: u32][type: u8][payload: bytes][crc32: u32]
//! ```
//!
//! - **length**: Total size of type + payload + crc (NOT including length itself)
//! - **type**: Record type tag (1=Transaction, 2=UpdateEpoch, 3=Checkpoint, 4=Backup, 5=TruncateHead)
//! - **payload**: bincode-serialized LogRecord
//! - **crc32**: CRC32 checksum over \[type\]\[payload\]

use crate::log_record::LogRecord;
use crc32fast::Hasher;
use replistate_core::{StateError, StateResult};

const TYPE_TRANSACTION: u8 = 1;
const TYPE_UPDATE_EPOCH: u8 = 2;
const TYPE_CHECKPOINT: u8 = 3;
const TYPE_BACKUP: u8 = 4;
const TYPE_TRUNCATE_HEAD: u8 = 5;

/// Minimum framed length after the length prefix: type(1) + crc(4)
const MIN_FRAME_LEN: usize = 5;

fn type_tag(record: &LogRecord) -> u8 {
    match record {
        LogRecord::Transaction { .. } => TYPE_TRANSACTION,
        LogRecord::UpdateEpoch { .. } => TYPE_UPDATE_EPOCH,
        LogRecord::Checkpoint { .. } => TYPE_CHECKPOINT,
        LogRecord::Backup { .. } => TYPE_BACKUP,
        LogRecord::TruncateHead { .. } => TYPE_TRUNCATE_HEAD,
    }
}

/// Encode a log record to bytes
///
/// Format: `[length: u32][type: u8][payload: bytes][crc32: u32]`
pub fn encode_record(record: &LogRecord) -> StateResult<Vec<u8>> {
    let tag = type_tag(record);
    let payload = bincode::serialize(record)?;

    let total_len = 1 + payload.len() + 4;
    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(tag);
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(buf)
}

/// Decode one log record with CRC validation
///
/// Returns `Ok(None)` when `buf` ends before the record does: a partial
/// write at the tail of the log, not corruption. `offset` is only used in
/// error messages.
pub fn decode_record(buf: &[u8], offset: u64) -> StateResult<Option<(LogRecord, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let total_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if total_len < MIN_FRAME_LEN {
        return Err(StateError::corruption(format!(
            "offset {}: invalid record length {} (minimum is {} bytes)",
            offset, total_len, MIN_FRAME_LEN
        )));
    }
    if buf.len() < 4 + total_len {
        return Ok(None);
    }

    let tag = buf[4];
    let payload = &buf[5..4 + total_len - 4];
    let crc_at = 4 + total_len - 4;
    let expected_crc = u32::from_le_bytes([
        buf[crc_at],
        buf[crc_at + 1],
        buf[crc_at + 2],
        buf[crc_at + 3],
    ]);

    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(payload);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(StateError::corruption(format!(
            "offset {}: CRC mismatch: expected {:08x}, got {:08x}",
            offset, expected_crc, actual_crc
        )));
    }

    let record: LogRecord = bincode::deserialize(payload).map_err(|e| {
        StateError::corruption(format!("offset {}: deserialization failed: {}", offset, e))
    })?;

    if type_tag(&record) != tag {
        return Err(StateError::corruption(format!(
            "offset {}: type tag mismatch: expected {}, got {}",
            offset,
            type_tag(&record),
            tag
        )));
    }

    Ok(Some((record, 4 + total_len)))
}

/// Decode every complete record in `buf`
///
/// Returns the records and the number of bytes they occupy; bytes past that
/// point belong to a partial trailing write.
pub fn decode_all(buf: &[u8]) -> StateResult<(Vec<LogRecord>, usize)> {
    let mut records = Vec::new();
    let mut consumed = 0;
    while consumed < buf.len() {
        match decode_record(&buf[consumed..], consumed as u64)? {
            Some((record, len)) => {
                records.push(record);
                consumed += len;
            }
            None => break,
        }
    }
    Ok((records, consumed))
}
