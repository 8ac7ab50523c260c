//! Backup and restore
//!
//! # Backup
//!
//! A full backup takes a checkpoint, copies the published checkpoint files
//! into `sm/` and the log records above the checkpoint into `lr/log.bin`. An
//! incremental backup carries only the log records written since the
//! previous backup of the chain. Either way the folder is handed to a
//! [`BackupUploader`] and deleted locally afterwards; a `Backup` marker in
//! the log records the completed backup so the next incremental can chain.
//!
//! # Restore
//!
//! Restore validates the chain, then, with commits held off, closes every
//! provider, empties the log, installs the full backup's checkpoint and
//! replays the log records of every link in chain order. Cancellation is
//! honored up to the point the local state starts being replaced.

use crate::checkpoint::CheckpointManager;
use crate::state_manager::StateManager;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use replistate_concurrency::{ApplyContext, LoggingReplicator, TransactionalReplicator};
use replistate_core::{
    with_deadline, CancellationToken, Epoch, Lsn, StateError, StateResult,
};
use replistate_durability::{
    load_chain, BackupChain, BackupInfo, BackupLayout, BackupMetadata, BackupOption, LogRecord,
    LogSummary,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Subdirectory of the replica work directory where backups are staged
pub const BACKUP_WORK_DIR: &str = "backup";

/// Receives a finished backup folder
///
/// Returning `Ok(false)` reports that the backup was not stored; the backup
/// then fails with `InvalidOperation`.
#[async_trait]
pub trait BackupUploader: Send + Sync {
    /// Store the backup described by `info`
    async fn upload(&self, info: &BackupInfo) -> StateResult<bool>;
}

/// Uploader that copies each backup into `<dest>/<backup id>`
#[derive(Debug, Clone)]
pub struct FolderUploader {
    dest: PathBuf,
}

impl FolderUploader {
    /// Copy backups under `dest`
    pub fn new(dest: impl AsRef<Path>) -> Self {
        FolderUploader {
            dest: dest.as_ref().to_path_buf(),
        }
    }

    /// Destination folder
    pub fn dest(&self) -> &Path {
        &self.dest
    }
}

#[async_trait]
impl BackupUploader for FolderUploader {
    async fn upload(&self, info: &BackupInfo) -> StateResult<bool> {
        let target = self.dest.join(info.backup_id().to_string());
        copy_dir_recursive(&info.directory, &target)?;
        debug!(backup_id = %info.backup_id(), path = %target.display(), "Backup copied");
        Ok(true)
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

/// How restore treats existing local state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorePolicy {
    /// Refuse unless the backup is ahead of the local state
    #[default]
    Safe,
    /// Replace local state unconditionally
    Force,
}

/// Backup settings taken from the replica configuration
#[derive(Debug, Clone, Copy)]
pub struct BackupSettings {
    /// Keep the log back to the last backup so incrementals can chain
    pub enable_incremental: bool,
    /// Most log records one incremental backup may carry
    pub max_incremental_records: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        BackupSettings {
            enable_incremental: true,
            max_incremental_records: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastBackup {
    id: Uuid,
    epoch: Epoch,
    lsn: Lsn,
}

/// Produces backups of one replica and restores backup chains into it
pub struct BackupManager {
    state_manager: Arc<StateManager>,
    replicator: Arc<LoggingReplicator>,
    checkpoints: Arc<CheckpointManager>,
    work_dir: PathBuf,
    settings: BackupSettings,
    last_backup: Mutex<Option<LastBackup>>,
    running: tokio::sync::Mutex<()>,
}

impl BackupManager {
    /// Backups staged under `work_dir`
    ///
    /// The last completed backup is recovered from the log's `Backup`
    /// marker, as summarized in `summary`.
    pub fn new(
        state_manager: Arc<StateManager>,
        replicator: Arc<LoggingReplicator>,
        checkpoints: Arc<CheckpointManager>,
        work_dir: impl AsRef<Path>,
        settings: BackupSettings,
        summary: &LogSummary,
    ) -> Self {
        let last_backup = summary
            .last_backup
            .map(|(id, epoch, lsn)| LastBackup { id, epoch, lsn });
        BackupManager {
            state_manager,
            replicator,
            checkpoints,
            work_dir: work_dir.as_ref().to_path_buf(),
            settings,
            last_backup: Mutex::new(last_backup),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Staging directory
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Settings in force
    pub fn settings(&self) -> BackupSettings {
        self.settings
    }

    /// Id and end LSN of the last completed backup
    pub fn last_backup(&self) -> Option<(Uuid, Lsn)> {
        self.last_backup.lock().map(|b| (b.id, b.lsn))
    }

    /// Lowest LSN log truncation must keep records above
    pub fn log_floor(&self) -> Option<Lsn> {
        if !self.settings.enable_incremental {
            return None;
        }
        self.last_backup.lock().map(|b| b.lsn)
    }

    // ========================================================================
    // Backup
    // ========================================================================

    /// Take a backup and hand it to `uploader`
    ///
    /// `timeout` and `cancel` bound the upload.
    pub async fn backup(
        &self,
        uploader: &dyn BackupUploader,
        option: BackupOption,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<BackupInfo> {
        cancel.check()?;
        let _running = self.running.lock().await;
        let backup_id = Uuid::new_v4();
        let layout = BackupLayout::new(self.work_dir.join(backup_id.to_string()));
        info!(%backup_id, ?option, "Backup started");

        let result = self
            .write_and_upload(uploader, &layout, backup_id, option, timeout, cancel)
            .await;
        if layout.dir().exists() {
            if let Err(e) = std::fs::remove_dir_all(layout.dir()) {
                warn!(path = %layout.dir().display(), error = %e, "Removing local backup folder failed");
            }
        }

        match result {
            Ok(info) => {
                self.replicator.log().append(&LogRecord::Backup {
                    backup_id,
                    epoch: info.epoch(),
                    lsn: info.end_lsn(),
                })?;
                *self.last_backup.lock() = Some(LastBackup {
                    id: backup_id,
                    epoch: info.epoch(),
                    lsn: info.end_lsn(),
                });
                info!(
                    %backup_id,
                    ?option,
                    start_lsn = %info.metadata.start_lsn,
                    end_lsn = %info.end_lsn(),
                    "Backup completed"
                );
                Ok(info)
            }
            Err(e) => {
                error!(%backup_id, ?option, error = %e, "Backup failed");
                Err(e)
            }
        }
    }

    async fn write_and_upload(
        &self,
        uploader: &dyn BackupUploader,
        layout: &BackupLayout,
        backup_id: Uuid,
        option: BackupOption,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<BackupInfo> {
        let metadata = match option {
            BackupOption::Full => self.write_full(layout, backup_id).await?,
            BackupOption::Incremental => self.write_incremental(layout, backup_id)?,
        };
        layout.write_metadata(&metadata)?;
        let info = BackupInfo {
            metadata,
            directory: layout.dir().to_path_buf(),
        };

        let stored = with_deadline(uploader.upload(&info), timeout, cancel, "backup upload").await?;
        if !stored {
            return Err(StateError::invalid_operation(format!(
                "upload of backup {} was rejected",
                backup_id
            )));
        }
        Ok(info)
    }

    async fn write_full(&self, layout: &BackupLayout, backup_id: Uuid) -> StateResult<BackupMetadata> {
        let checkpoint_lsn = self.checkpoints.checkpoint(self.log_floor()).await?;
        let files = self
            .checkpoints
            .layout()
            .copy_published(&layout.checkpoint_dir())?;
        let records = self
            .replicator
            .log()
            .read_transactions_after(checkpoint_lsn)?;
        let end_lsn = records.last().map_or(checkpoint_lsn, LogRecord::lsn);
        layout.write_log(&records)?;
        debug!(
            %backup_id,
            checkpoint_lsn = %checkpoint_lsn,
            files,
            records = records.len(),
            "Full backup written"
        );
        Ok(BackupMetadata {
            backup_id,
            parent_backup_id: None,
            option: BackupOption::Full,
            epoch: self.replicator.epoch(),
            start_lsn: Lsn::ZERO,
            end_lsn,
            created_at: Utc::now(),
        })
    }

    fn write_incremental(&self, layout: &BackupLayout, backup_id: Uuid) -> StateResult<BackupMetadata> {
        if !self.settings.enable_incremental {
            return Err(StateError::invalid_operation(
                "incremental backups are disabled",
            ));
        }
        let Some(last) = *self.last_backup.lock() else {
            return Err(StateError::InvalidBackupChain(
                "incremental backup requires a prior backup".to_string(),
            ));
        };
        let epoch = self.replicator.epoch();
        if epoch.data_loss_number != last.epoch.data_loss_number {
            return Err(StateError::InvalidBackupChain(format!(
                "data loss since backup {}; a full backup is required",
                last.id
            )));
        }
        let log = self.replicator.log();
        if log.truncated_through() > last.lsn {
            return Err(StateError::InvalidBackupChain(format!(
                "log no longer holds the records after backup {}",
                last.id
            )));
        }

        let records = log.read_transactions_after(last.lsn)?;
        let Some(end_lsn) = records.last().map(LogRecord::lsn) else {
            return Err(StateError::invalid_operation(format!(
                "nothing committed since backup {}",
                last.id
            )));
        };
        if records.len() > self.settings.max_incremental_records {
            return Err(StateError::invalid_operation(format!(
                "incremental backup would carry {} records, more than {}",
                records.len(),
                self.settings.max_incremental_records
            )));
        }
        layout.write_log(&records)?;
        debug!(%backup_id, parent = %last.id, records = records.len(), "Incremental backup written");
        Ok(BackupMetadata {
            backup_id,
            parent_backup_id: Some(last.id),
            option: BackupOption::Incremental,
            epoch,
            start_lsn: last.lsn.next(),
            end_lsn,
            created_at: Utc::now(),
        })
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Validate the chain in `folder` against local state
    pub fn prepare_restore(&self, folder: &Path, policy: RestorePolicy) -> StateResult<BackupChain> {
        let chain = load_chain(folder)?;
        if policy == RestorePolicy::Safe {
            let epoch = self.replicator.epoch();
            let tail = self.replicator.tail_lsn();
            let ahead = epoch < chain.epoch() || (epoch == chain.epoch() && tail < chain.end_lsn());
            if !ahead {
                return Err(StateError::RestoreFailed(format!(
                    "local state at epoch {} lsn {} is not behind the backup at epoch {} lsn {}",
                    epoch,
                    tail,
                    chain.epoch(),
                    chain.end_lsn()
                )));
            }
        }
        Ok(chain)
    }

    /// Replace local state with `chain`
    ///
    /// Providers are left closed; the caller opens them and raises the
    /// rebuild. Returns the restored tail LSN.
    pub async fn restore_chain(
        &self,
        chain: &BackupChain,
        cancel: &CancellationToken,
    ) -> StateResult<Lsn> {
        let _running = self.running.lock().await;
        let _checkpoints = self.checkpoints.pause().await;
        let manager = Arc::clone(self.state_manager.manager());
        let _barrier = manager.commit_barrier().await;
        cancel.check()?;
        info!(
            full = %chain.full().backup_id(),
            incrementals = chain.incrementals().len(),
            end_lsn = %chain.end_lsn(),
            "Restore started"
        );

        self.state_manager.close_all().await?;
        let log = self.replicator.log();
        log.reset()?;
        self.checkpoints
            .replace_with(&chain.full().layout().checkpoint_dir())?;

        let mut applied = self.checkpoints.recover_paused().await?;
        log.append(&LogRecord::Checkpoint { lsn: applied })?;
        for link in &chain.links {
            let mut replayed = 0usize;
            for record in link.layout().read_log()? {
                if !record.is_transaction() || record.lsn() <= applied {
                    continue;
                }
                log.append(&record)?;
                self.state_manager
                    .apply_record(&record, ApplyContext::Recovery)?;
                applied = record.lsn();
                replayed += 1;
            }
            debug!(backup_id = %link.backup_id(), records = replayed, "Backup link replayed");
        }

        let epoch = chain.epoch();
        log.append(&LogRecord::UpdateEpoch { epoch, lsn: applied })?;
        log.flush()?;
        self.replicator.restore_position(epoch, applied);
        manager.reset_last_committed(applied);
        *self.last_backup.lock() = None;

        info!(lsn = %applied, %epoch, providers = self.state_manager.len(), "Restore completed");
        Ok(applied)
    }
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("work_dir", &self.work_dir)
            .field("settings", &self.settings)
            .field("last_backup", &self.last_backup())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_folder_uploader_copies_tree() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let layout = BackupLayout::new(src.path());
        layout.write_log(&[]).unwrap();
        let metadata = BackupMetadata {
            backup_id: Uuid::new_v4(),
            parent_backup_id: None,
            option: BackupOption::Full,
            epoch: Epoch::default(),
            start_lsn: Lsn::ZERO,
            end_lsn: Lsn::new(3),
            created_at: Utc::now(),
        };
        layout.write_metadata(&metadata).unwrap();
        let info = BackupInfo {
            metadata: metadata.clone(),
            directory: src.path().to_path_buf(),
        };

        let uploader = FolderUploader::new(dest.path());
        assert!(uploader.upload(&info).await.unwrap());

        let copied = BackupLayout::new(dest.path().join(metadata.backup_id.to_string()));
        assert_eq!(copied.read_metadata().unwrap(), Some(metadata));
        assert!(copied.log_file().exists());
    }

    #[test]
    fn test_default_policy_is_safe() {
        assert_eq!(RestorePolicy::default(), RestorePolicy::Safe);
        let settings = BackupSettings::default();
        assert!(settings.enable_incremental);
    }
}
