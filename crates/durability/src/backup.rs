//! Backup folders and backup chains
//!
//! A backup is a directory named by its GUID:
//!
//! ```text
//! <backup-id>/
//! ├── backup.metadata        # full backup (JSON)
//! │   or incremental.metadata
//! ├── sm/                    # checkpoint files (full backups only)
//! │   ├── sm.chk
//! │   └── <id>.chk
//! └── lr/
//!     └── log.bin            # framed log records covered by the backup
//! ```
//!
//! A chain is one full backup followed by incrementals, each naming its
//! predecessor through `parent_backup_id` and starting exactly one LSN after
//! the predecessor ends. Restoring anything else fails with
//! `StateError::InvalidBackupChain`.

use crate::encoding::{decode_all, encode_record};
use crate::log_record::LogRecord;
use chrono::{DateTime, Utc};
use replistate_core::{Epoch, Lsn, StateError, StateResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Metadata file name of a full backup
pub const FULL_METADATA_FILE: &str = "backup.metadata";
/// Metadata file name of an incremental backup
pub const INCREMENTAL_METADATA_FILE: &str = "incremental.metadata";
/// Checkpoint subdirectory
pub const CHECKPOINT_DIR: &str = "sm";
/// Log subdirectory
pub const LOG_DIR: &str = "lr";
/// Log file inside the log subdirectory
pub const LOG_FILE: &str = "log.bin";

/// Kind of backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupOption {
    /// Checkpoint plus log tail; starts a new chain
    Full,
    /// Log records since the previous backup in the chain
    Incremental,
}

impl BackupOption {
    /// Metadata file name for this kind
    pub fn metadata_file(&self) -> &'static str {
        match self {
            BackupOption::Full => FULL_METADATA_FILE,
            BackupOption::Incremental => INCREMENTAL_METADATA_FILE,
        }
    }
}

/// Persisted description of one backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Backup id
    pub backup_id: Uuid,
    /// Previous backup in the chain (`None` for full backups)
    pub parent_backup_id: Option<Uuid>,
    /// Full or incremental
    pub option: BackupOption,
    /// Epoch of the last covered record
    pub epoch: Epoch,
    /// First LSN covered
    pub start_lsn: Lsn,
    /// Last LSN covered
    pub end_lsn: Lsn,
    /// When the backup was taken
    pub created_at: DateTime<Utc>,
}

/// Backup metadata plus where the backup lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Metadata
    pub metadata: BackupMetadata,
    /// Backup directory
    pub directory: PathBuf,
}

impl BackupInfo {
    /// Backup id
    pub fn backup_id(&self) -> Uuid {
        self.metadata.backup_id
    }

    /// Full or incremental
    pub fn option(&self) -> BackupOption {
        self.metadata.option
    }

    /// Last LSN covered
    pub fn end_lsn(&self) -> Lsn {
        self.metadata.end_lsn
    }

    /// Epoch of the last covered record
    pub fn epoch(&self) -> Epoch {
        self.metadata.epoch
    }

    /// Directory layout of this backup
    pub fn layout(&self) -> BackupLayout {
        BackupLayout::new(&self.directory)
    }
}

/// Paths inside one backup directory
#[derive(Debug, Clone)]
pub struct BackupLayout {
    dir: PathBuf,
}

impl BackupLayout {
    /// Layout rooted at `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        BackupLayout {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Backup directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Checkpoint subdirectory
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_DIR)
    }

    /// Log file
    pub fn log_file(&self) -> PathBuf {
        self.dir.join(LOG_DIR).join(LOG_FILE)
    }

    /// Metadata file for `option`
    pub fn metadata_file(&self, option: BackupOption) -> PathBuf {
        self.dir.join(option.metadata_file())
    }

    /// Write the metadata file
    pub fn write_metadata(&self, metadata: &BackupMetadata) -> StateResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(metadata)?;
        let mut file = File::create(self.metadata_file(metadata.option))?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read whichever metadata file is present
    pub fn read_metadata(&self) -> StateResult<Option<BackupMetadata>> {
        for option in [BackupOption::Full, BackupOption::Incremental] {
            let path = self.metadata_file(option);
            if path.exists() {
                let metadata: BackupMetadata = serde_json::from_slice(&std::fs::read(&path)?)?;
                if metadata.option != option {
                    return Err(StateError::InvalidBackupChain(format!(
                        "{} describes a {:?} backup",
                        path.display(),
                        metadata.option
                    )));
                }
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    /// Write the log records covered by the backup
    pub fn write_log(&self, records: &[LogRecord]) -> StateResult<usize> {
        let path = self.log_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        for record in records {
            file.write_all(&encode_record(record)?)?;
        }
        file.sync_all()?;
        Ok(records.len())
    }

    /// Read the log records covered by the backup
    pub fn read_log(&self) -> StateResult<Vec<LogRecord>> {
        let path = self.log_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&path)?;
        let (records, consumed) = decode_all(&bytes)?;
        if consumed != bytes.len() {
            return Err(StateError::RestoreFailed(format!(
                "{} ends with a partial record",
                path.display()
            )));
        }
        Ok(records)
    }
}

/// A validated full + incremental chain, in restore order
#[derive(Debug, Clone)]
pub struct BackupChain {
    /// Every link, full backup first
    pub links: Vec<BackupInfo>,
}

impl BackupChain {
    /// The full backup at the head of the chain
    pub fn full(&self) -> &BackupInfo {
        &self.links[0]
    }

    /// Incrementals in order
    pub fn incrementals(&self) -> &[BackupInfo] {
        &self.links[1..]
    }

    /// The newest link
    pub fn last(&self) -> &BackupInfo {
        &self.links[self.links.len() - 1]
    }

    /// Last LSN covered by the chain
    pub fn end_lsn(&self) -> Lsn {
        self.last().end_lsn()
    }

    /// Highest epoch covered by the chain
    pub fn epoch(&self) -> Epoch {
        self.links
            .iter()
            .map(|l| l.epoch())
            .max()
            .unwrap_or_default()
    }
}

/// Discover and validate the backup chain stored under `folder`
///
/// `folder` is either a single backup directory or a directory whose
/// immediate subdirectories are backups.
pub fn load_chain(folder: &Path) -> StateResult<BackupChain> {
    if !folder.is_dir() {
        return Err(StateError::RestoreFailed(format!(
            "backup folder {} does not exist",
            folder.display()
        )));
    }

    let mut found = Vec::new();
    if let Some(metadata) = BackupLayout::new(folder).read_metadata()? {
        found.push(BackupInfo {
            metadata,
            directory: folder.to_path_buf(),
        });
    } else {
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(folder)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            if let Some(metadata) = BackupLayout::new(&dir).read_metadata()? {
                found.push(BackupInfo {
                    metadata,
                    directory: dir,
                });
            }
        }
    }

    order_chain(found)
}

/// Order backups into a chain and validate every link
pub fn order_chain(backups: Vec<BackupInfo>) -> StateResult<BackupChain> {
    let mut fulls = backups
        .iter()
        .filter(|b| b.option() == BackupOption::Full);
    let full = match (fulls.next(), fulls.next()) {
        (Some(full), None) => full.clone(),
        (None, _) => {
            return Err(StateError::InvalidBackupChain(
                "no full backup in folder".to_string(),
            ))
        }
        (Some(_), Some(_)) => {
            return Err(StateError::InvalidBackupChain(
                "more than one full backup in folder".to_string(),
            ))
        }
    };

    let mut by_parent: HashMap<Uuid, BackupInfo> = HashMap::new();
    for backup in backups
        .into_iter()
        .filter(|b| b.option() == BackupOption::Incremental)
    {
        let parent = backup.metadata.parent_backup_id.ok_or_else(|| {
            StateError::InvalidBackupChain(format!(
                "incremental backup {} has no parent",
                backup.backup_id()
            ))
        })?;
        if let Some(existing) = by_parent.insert(parent, backup) {
            return Err(StateError::InvalidBackupChain(format!(
                "backup {} has more than one successor (one is {})",
                parent,
                existing.backup_id()
            )));
        }
    }

    let mut links = vec![full];
    while let Some(next) = by_parent.remove(&links[links.len() - 1].backup_id()) {
        let previous = &links[links.len() - 1];
        if next.metadata.start_lsn != previous.end_lsn().next() {
            return Err(StateError::InvalidBackupChain(format!(
                "backup {} starts at {} but {} ends at {}",
                next.backup_id(),
                next.metadata.start_lsn,
                previous.backup_id(),
                previous.end_lsn()
            )));
        }
        if next.epoch() < previous.epoch() {
            return Err(StateError::InvalidBackupChain(format!(
                "backup {} has an older epoch than its parent",
                next.backup_id()
            )));
        }
        links.push(next);
    }

    if let Some(orphan) = by_parent.values().next() {
        return Err(StateError::InvalidBackupChain(format!(
            "incremental backup {} does not link to the chain (missing parent {:?})",
            orphan.backup_id(),
            orphan.metadata.parent_backup_id
        )));
    }

    debug!(links = links.len(), end_lsn = %links[links.len() - 1].end_lsn(), "Backup chain validated");
    Ok(BackupChain { links })
}
