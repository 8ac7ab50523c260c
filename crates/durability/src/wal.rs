//! Write-ahead log
//!
//! The replica's durable, append-only record of committed transactions.
//! Consumers see it through the [`LogStore`] trait:
//!
//! - `append()` - Append a record, honoring the durability mode
//! - `read_all()` - Read every complete record
//! - `truncate_head()` - Drop everything at or below a checkpoint boundary
//! - `reset()` - Empty the log (restore)
//!
//! ## Durability Modes
//!
//! - `Strict` - fsync after every append (DEFAULT)
//! - `Batched` - fsync every N appends OR T ms
//!
//! Two implementations: [`FileLog`] (a single file of framed records) and
//! [`MemoryLog`] for tests and ephemeral replicas.

use crate::encoding::{decode_all, encode_record};
use crate::log_record::{retain_after, LogRecord, LogSummary};
use parking_lot::Mutex;
use replistate_core::{Lsn, StateError, StateResult};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Durability mode configuration
///
/// Controls when fsync is called to ensure data reaches disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every append
    #[default]
    Strict,

    /// fsync every N appends OR every T milliseconds
    ///
    /// May lose up to batch_size records or interval_ms of data on crash.
    Batched {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
        /// Maximum appends between fsyncs
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// Default batched settings: 100ms or 1000 appends
    pub fn batched() -> Self {
        DurabilityMode::Batched {
            interval_ms: 100,
            batch_size: 1000,
        }
    }
}

/// Append-only durable log
pub trait LogStore: Send + Sync {
    /// Append a record
    fn append(&self, record: &LogRecord) -> StateResult<()>;

    /// Force buffered appends to stable storage
    fn flush(&self) -> StateResult<()>;

    /// Every complete record, in append order
    fn read_all(&self) -> StateResult<Vec<LogRecord>>;

    /// Transaction records with an LSN strictly greater than `lsn`
    fn read_transactions_after(&self, lsn: Lsn) -> StateResult<Vec<LogRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.is_transaction() && r.lsn() > lsn)
            .collect())
    }

    /// Remove every record at or below `up_to`
    fn truncate_head(&self, up_to: Lsn) -> StateResult<()>;

    /// Remove every record
    fn reset(&self) -> StateResult<()>;

    /// Highest LSN removed by truncation (`Lsn::ZERO` if none)
    fn truncated_through(&self) -> Lsn;
}

// ============================================================================
// File-backed log
// ============================================================================

struct FileLogInner {
    writer: BufWriter<File>,
    writes_since_fsync: usize,
    last_fsync: Instant,
    truncated_through: Lsn,
}

/// Write-ahead log stored in a single file
///
/// File format: sequence of framed records (see `encoding`). A partial record
/// at the tail, left by a crash mid-append, is cut off on open.
pub struct FileLog {
    path: PathBuf,
    durability_mode: DurabilityMode,
    inner: Mutex<FileLogInner>,
}

impl FileLog {
    /// Open an existing log or create a new one
    ///
    /// Creates parent directories if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P, durability_mode: DurabilityMode) -> StateResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut bytes = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut bytes)?;
        }
        let (records, valid_len) = decode_all(&bytes)?;
        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = bytes.len(),
                "Discarding partial record at log tail"
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(valid_len as u64)?;
        drop(file);

        let summary = LogSummary::scan(&records);
        info!(
            path = %path.display(),
            records = records.len(),
            truncated_through = %summary.truncated_through,
            "Opened log"
        );

        Ok(FileLog {
            durability_mode,
            inner: Mutex::new(FileLogInner {
                writer: Self::append_writer(&path)?,
                writes_since_fsync: 0,
                last_fsync: Instant::now(),
                truncated_through: summary.truncated_through,
            }),
            path,
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_writer(path: &Path) -> StateResult<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn fsync(inner: &mut FileLogInner) -> StateResult<()> {
        inner.writer.flush()?;
        inner.writer.get_mut().sync_all()?;
        inner.writes_since_fsync = 0;
        inner.last_fsync = Instant::now();
        Ok(())
    }

    /// Replace the file contents with `records` (temp file + rename)
    fn rewrite(&self, inner: &mut FileLogInner, records: &[LogRecord]) -> StateResult<()> {
        inner.writer.flush()?;
        let temp_path = self.path.with_extension("log.tmp");
        {
            let mut temp = BufWriter::new(File::create(&temp_path)?);
            for record in records {
                temp.write_all(&encode_record(record)?)?;
            }
            temp.flush()?;
            temp.get_ref().sync_all()?;
        }
        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            warn!(temp_path = %temp_path.display(), error = %e, "Rename failed, cleaning up temp file");
            let _ = std::fs::remove_file(&temp_path);
            return Err(StateError::Io(e));
        }
        inner.writer = Self::append_writer(&self.path)?;
        inner.writes_since_fsync = 0;
        Ok(())
    }
}

impl LogStore for FileLog {
    fn append(&self, record: &LogRecord) -> StateResult<()> {
        let encoded = encode_record(record)?;
        let mut inner = self.inner.lock();
        inner.writer.write_all(&encoded)?;

        match self.durability_mode {
            DurabilityMode::Strict => Self::fsync(&mut inner)?,
            DurabilityMode::Batched {
                interval_ms,
                batch_size,
            } => {
                inner.writes_since_fsync += 1;
                let elapsed = inner.last_fsync.elapsed().as_millis() as u64;
                if elapsed >= interval_ms || inner.writes_since_fsync >= batch_size {
                    Self::fsync(&mut inner)?;
                }
            }
        }
        debug!(kind = record.kind(), lsn = %record.lsn(), bytes = encoded.len(), "Appended log record");
        Ok(())
    }

    fn flush(&self) -> StateResult<()> {
        let mut inner = self.inner.lock();
        Self::fsync(&mut inner)
    }

    fn read_all(&self) -> StateResult<Vec<LogRecord>> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let bytes = std::fs::read(&self.path)?;
        drop(inner);
        let (records, _) = decode_all(&bytes)?;
        Ok(records)
    }

    fn truncate_head(&self, up_to: Lsn) -> StateResult<()> {
        let mut inner = self.inner.lock();
        if up_to <= inner.truncated_through {
            return Ok(());
        }
        inner.writer.flush()?;
        let (records, _) = decode_all(&std::fs::read(&self.path)?)?;
        let before = records.len();
        let kept = retain_after(records, up_to);
        self.rewrite(&mut inner, &kept)?;
        inner.truncated_through = up_to;
        info!(up_to = %up_to, before, after = kept.len(), "Truncated log head");
        Ok(())
    }

    fn reset(&self) -> StateResult<()> {
        let mut inner = self.inner.lock();
        self.rewrite(&mut inner, &[])?;
        inner.truncated_through = Lsn::ZERO;
        info!(path = %self.path.display(), "Log reset");
        Ok(())
    }

    fn truncated_through(&self) -> Lsn {
        self.inner.lock().truncated_through
    }
}

// ============================================================================
// In-memory log
// ============================================================================

#[derive(Default)]
struct MemoryLogInner {
    records: Vec<LogRecord>,
    truncated_through: Lsn,
}

/// Log kept in memory; nothing survives the process
#[derive(Default)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

impl MemoryLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether the log holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStore for MemoryLog {
    fn append(&self, record: &LogRecord) -> StateResult<()> {
        self.inner.lock().records.push(record.clone());
        Ok(())
    }

    fn flush(&self) -> StateResult<()> {
        Ok(())
    }

    fn read_all(&self) -> StateResult<Vec<LogRecord>> {
        Ok(self.inner.lock().records.clone())
    }

    fn truncate_head(&self, up_to: Lsn) -> StateResult<()> {
        let mut inner = self.inner.lock();
        if up_to <= inner.truncated_through {
            return Ok(());
        }
        let records = std::mem::take(&mut inner.records);
        inner.records = retain_after(records, up_to);
        inner.truncated_through = up_to;
        Ok(())
    }

    fn reset(&self) -> StateResult<()> {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.truncated_through = Lsn::ZERO;
        Ok(())
    }

    fn truncated_through(&self) -> Lsn {
        self.inner.lock().truncated_through
    }
}
