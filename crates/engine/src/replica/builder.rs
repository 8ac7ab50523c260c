//! Replica builder
//!
//! ```ignore
//! use replistate_engine::Replica;
//!
//! // Defaults from <dir>/replica.toml
//! let replica = Replica::open("/data/replica").await?;
//!
//! // Typed stores, handlers, explicit configuration
//! let replica = Replica::builder()
//!     .path("/data/replica")
//!     .register_store::<u64, String>("u64:String")
//!     .change_handler(handler)
//!     .open()
//!     .await?;
//! ```

use super::{
    DataLossHandler, Replica, ReplicaConfig, CHECKPOINT_DIR, CONFIG_FILE_NAME, LOCK_FILE, LOG_DIR,
    LOG_FILE,
};
use crate::backup::{BackupManager, BackupSettings, BACKUP_WORK_DIR};
use crate::checkpoint::CheckpointManager;
use crate::state_manager::factory::ProviderFactories;
use crate::state_manager::notification::StateManagerChangeHandler;
use crate::state_manager::StateManager;
use replistate_concurrency::{
    ApplyContext, LoggingReplicator, TransactionManager, TransactionalReplicator,
};
use replistate_core::{
    CancellationToken, Limits, StateError, StateResult, StoreKey, StoreValue,
};
use replistate_durability::{CheckpointLayout, FileLog, LogStore, LogSummary};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Builder for [`Replica`]
pub struct ReplicaBuilder {
    path: Option<PathBuf>,
    config: Option<ReplicaConfig>,
    factories: Arc<ProviderFactories>,
    change_handler: Option<Arc<dyn StateManagerChangeHandler>>,
    data_loss_handler: Option<Arc<dyn DataLossHandler>>,
    limits: Limits,
}

impl Default for ReplicaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaBuilder {
    /// Builder with the default provider factories
    pub fn new() -> Self {
        ReplicaBuilder {
            path: None,
            config: None,
            factories: Arc::new(ProviderFactories::new()),
            change_handler: None,
            data_loss_handler: None,
            limits: Limits::default(),
        }
    }

    /// Work directory (required)
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Use `config` instead of reading `replica.toml`
    pub fn config(mut self, config: ReplicaConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register `Store<K, V>` under the language metadata `metadata`
    pub fn register_store<K: StoreKey, V: StoreValue>(self, metadata: &str) -> Self {
        self.factories.register_store::<K, V>(metadata);
        self
    }

    /// Replace the provider factory registry
    pub fn factories(mut self, factories: Arc<ProviderFactories>) -> Self {
        self.factories = factories;
        self
    }

    /// Namespace change handler, registered before recovery so it sees the
    /// first `Rebuilt`
    pub fn change_handler(mut self, handler: Arc<dyn StateManagerChangeHandler>) -> Self {
        self.change_handler = Some(handler);
        self
    }

    /// Handler consulted by [`Replica::on_data_loss`]
    pub fn data_loss_handler(mut self, handler: Arc<dyn DataLossHandler>) -> Self {
        self.data_loss_handler = Some(handler);
        self
    }

    /// Key and value size limits
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Lock the directory, recover and open the replica
    ///
    /// # Errors
    ///
    /// Fails if no path was set, the directory is locked by another process,
    /// the configuration is invalid, or recovery fails. Recovery failures
    /// (corrupt files, unknown type descriptors) are never papered over.
    pub async fn open(self) -> StateResult<Arc<Replica>> {
        let path = self
            .path
            .ok_or_else(|| StateError::invalid_operation("ReplicaBuilder::open requires a path"))?;
        std::fs::create_dir_all(&path)?;

        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path.join(LOCK_FILE))?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            StateError::invalid_operation(format!(
                "replica at '{}' is already in use by another process",
                path.display()
            ))
        })?;

        let config = match self.config {
            Some(config) => {
                config.durability_mode()?;
                config
            }
            None => {
                let config_path = path.join(CONFIG_FILE_NAME);
                ReplicaConfig::write_default_if_missing(&config_path)?;
                ReplicaConfig::from_file(&config_path)?
            }
        };

        let log: Arc<dyn LogStore> = Arc::new(FileLog::open(
            path.join(LOG_DIR).join(LOG_FILE),
            config.durability_mode()?,
        )?);
        let records = log.read_all()?;
        let summary = LogSummary::scan(&records);

        let replicator = Arc::new(LoggingReplicator::new(Arc::clone(&log)));
        let manager = TransactionManager::new(
            Arc::clone(&replicator) as Arc<dyn TransactionalReplicator>
        );
        let state_manager = StateManager::new(
            Arc::clone(&manager),
            self.factories,
            self.limits,
            config.default_timeout(),
        );
        if let Some(handler) = self.change_handler {
            state_manager.set_change_handler(handler, None);
        }
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&state_manager),
            Arc::clone(&replicator),
            CheckpointLayout::new(path.join(CHECKPOINT_DIR)),
        ));

        let checkpoint_lsn = checkpoints.recover().await?;
        if log.truncated_through() > checkpoint_lsn {
            return Err(StateError::corruption(format!(
                "log truncated through {} but the checkpoint ends at {}",
                log.truncated_through(),
                checkpoint_lsn
            )));
        }
        let mut tail = checkpoint_lsn;
        let mut replayed = 0usize;
        for record in records.iter().filter(|r| r.is_transaction()) {
            if record.lsn() <= tail {
                continue;
            }
            state_manager.apply_record(record, ApplyContext::Recovery)?;
            tail = record.lsn();
            replayed += 1;
        }

        let epoch = summary.epoch.unwrap_or_default();
        replicator.restore_position(epoch, tail);
        manager.set_last_committed(tail);
        state_manager.open_all().await?;
        info!(
            path = %path.display(),
            checkpoint_lsn = %checkpoint_lsn,
            records_replayed = replayed,
            lsn = %tail,
            %epoch,
            providers = state_manager.len(),
            "Recovery complete"
        );

        let backups = BackupManager::new(
            Arc::clone(&state_manager),
            Arc::clone(&replicator),
            Arc::clone(&checkpoints),
            path.join(BACKUP_WORK_DIR),
            BackupSettings {
                enable_incremental: config.enable_incremental_backups,
                max_incremental_records: config.max_incremental_backup_records,
            },
            &summary,
        );
        let timeout = config.default_timeout();
        let replica = Replica::from_parts(
            path,
            config,
            replicator,
            manager,
            state_manager,
            checkpoints,
            backups,
            self.data_loss_handler,
            lock_file,
        );
        replica
            .raise_rebuilt(timeout, &CancellationToken::none())
            .await?;
        Ok(replica)
    }
}

impl std::fmt::Debug for ReplicaBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaBuilder")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_requires_path() {
        let err = ReplicaBuilder::new().open().await.unwrap_err();
        assert!(matches!(err, StateError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_open_writes_default_config() {
        let dir = TempDir::new().unwrap();
        let replica = ReplicaBuilder::new().path(dir.path()).open().await.unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(replica.config(), &ReplicaConfig::default());
        replica.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_open_is_refused_while_locked() {
        let dir = TempDir::new().unwrap();
        let first = ReplicaBuilder::new().path(dir.path()).open().await.unwrap();
        let err = ReplicaBuilder::new().path(dir.path()).open().await.unwrap_err();
        assert!(err.to_string().contains("already in use"));

        first.close().await.unwrap();
        let second = ReplicaBuilder::new().path(dir.path()).open().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = ReplicaConfig {
            durability: "sometimes".to_string(),
            ..ReplicaConfig::default()
        };
        let err = ReplicaBuilder::new()
            .path(dir.path())
            .config(config)
            .open()
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidOperation(_)));
    }
}
