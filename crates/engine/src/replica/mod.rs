//! Replica: one durable, role-aware instance of the state
//!
//! A replica owns a work directory:
//!
//! ```text
//! <dir>/
//! ├── .lock              # exclusive process lock (fs2)
//! ├── replica.toml       # ReplicaConfig
//! ├── log/replica.log    # framed log records
//! ├── checkpoint/        # sm.chk + <id>.chk
//! └── backup/<id>/       # backups being staged
//! ```
//!
//! # Open
//!
//! 1. Lock the directory and load `replica.toml`
//! 2. Recover the published checkpoint (namespace first, then providers)
//! 3. Replay transaction records above the checkpoint
//! 4. Open providers and raise `Rebuilt`, waiting for the namespace
//!    enumerator to be drained
//!
//! The replica starts without a role; the replication layer assigns one
//! with [`Replica::change_role`].

pub mod builder;
pub mod config;

pub use builder::ReplicaBuilder;
pub use config::{ReplicaConfig, CONFIG_FILE_NAME};

use crate::backup::{BackupManager, BackupUploader, RestorePolicy};
use crate::checkpoint::CheckpointManager;
use crate::state_manager::StateManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use replistate_concurrency::{
    ApplyContext, ChangeNotifier, LoggingReplicator, Transaction, TransactionManager,
    TransactionalReplicator,
};
use replistate_core::{
    with_deadline, CancellationToken, Epoch, Lsn, ReplicaRole, StateError, StateResult,
};
use replistate_durability::{BackupInfo, BackupOption, LogRecord};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Log subdirectory
pub const LOG_DIR: &str = "log";
/// Log file inside the log subdirectory
pub const LOG_FILE: &str = "replica.log";
/// Checkpoint subdirectory
pub const CHECKPOINT_DIR: &str = "checkpoint";
/// Process lock file
pub const LOCK_FILE: &str = ".lock";

/// Decides what happens when the replication layer declares data loss
#[async_trait]
pub trait DataLossHandler: Send + Sync {
    /// Restore through `ctx` or accept the current state
    ///
    /// Returns whether the state changed.
    async fn on_data_loss(&self, ctx: RestoreContext) -> StateResult<bool>;
}

/// Restore entry point handed to a [`DataLossHandler`]
#[derive(Clone)]
pub struct RestoreContext {
    replica: Arc<Replica>,
}

impl RestoreContext {
    /// Replica the data loss was declared on
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Restore the backup chain in `folder`
    ///
    /// Unlike [`Replica::restore`], this works while the replica is primary.
    pub async fn restore(
        &self,
        folder: &Path,
        policy: RestorePolicy,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<()> {
        self.replica.restore_unchecked(folder, policy, timeout, cancel).await?;
        self.replica.restored_during_data_loss.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for RestoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreContext")
            .field("path", &self.replica.path())
            .finish()
    }
}

/// One replica of the replicated state
pub struct Replica {
    path: PathBuf,
    config: ReplicaConfig,
    replicator: Arc<LoggingReplicator>,
    manager: Arc<TransactionManager>,
    state_manager: Arc<StateManager>,
    checkpoints: Arc<CheckpointManager>,
    backups: BackupManager,
    data_loss_handler: Option<Arc<dyn DataLossHandler>>,
    data_loss_in_flight: AtomicBool,
    restored_during_data_loss: AtomicBool,
    auto_checkpoint: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    lock_file: Mutex<Option<File>>,
}

impl Replica {
    /// Open (or create) the replica in `path` with default settings
    pub async fn open(path: impl AsRef<Path>) -> StateResult<Arc<Replica>> {
        ReplicaBuilder::new().path(path.as_ref()).open().await
    }

    /// Builder for custom factories, handlers and configuration
    pub fn builder() -> ReplicaBuilder {
        ReplicaBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        path: PathBuf,
        config: ReplicaConfig,
        replicator: Arc<LoggingReplicator>,
        manager: Arc<TransactionManager>,
        state_manager: Arc<StateManager>,
        checkpoints: Arc<CheckpointManager>,
        backups: BackupManager,
        data_loss_handler: Option<Arc<dyn DataLossHandler>>,
        lock_file: File,
    ) -> Arc<Replica> {
        Arc::new(Replica {
            path,
            config,
            replicator,
            manager,
            state_manager,
            checkpoints,
            backups,
            data_loss_handler,
            data_loss_in_flight: AtomicBool::new(false),
            restored_during_data_loss: AtomicBool::new(false),
            auto_checkpoint: Mutex::new(None),
            closed: AtomicBool::new(false),
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Work directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration in force
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Current role
    pub fn role(&self) -> ReplicaRole {
        self.replicator.role()
    }

    /// Current epoch
    pub fn epoch(&self) -> Epoch {
        self.replicator.epoch()
    }

    /// Highest LSN whose effects are visible
    pub fn last_committed_lsn(&self) -> Lsn {
        self.manager.last_committed_lsn()
    }

    /// Namespace of state providers
    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state_manager
    }

    /// Transaction machinery
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Replicator and, through it, the log
    pub fn replicator(&self) -> &Arc<LoggingReplicator> {
        &self.replicator
    }

    /// Checkpoint coordination
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Backup coordination
    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StateResult<()> {
        if self.is_closed() {
            return Err(StateError::ProviderClosed(format!(
                "replica at {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Start a read-write transaction
    pub fn create_transaction(&self) -> StateResult<Transaction> {
        self.ensure_open()?;
        Ok(self.manager.create_transaction())
    }

    /// Start a transaction that refuses writes
    pub fn create_read_only_transaction(&self) -> StateResult<Transaction> {
        self.ensure_open()?;
        Ok(self.manager.create_read_only_transaction())
    }

    // ========================================================================
    // Role and epoch
    // ========================================================================

    /// Adopt `role` and propagate it to every provider
    ///
    /// Automatic checkpoints run only while primary.
    pub async fn change_role(self: &Arc<Self>, role: ReplicaRole) -> StateResult<()> {
        self.ensure_open()?;
        let previous = self.role();
        self.replicator.set_role(role);
        self.state_manager.change_role(role).await?;
        if role.is_primary() {
            self.start_auto_checkpoint();
        } else {
            self.stop_auto_checkpoint();
        }
        info!(?previous, ?role, path = %self.path.display(), "Replica role changed");
        Ok(())
    }

    /// Enter `epoch`; older epochs are rejected
    pub fn update_epoch(&self, epoch: Epoch) -> StateResult<()> {
        self.ensure_open()?;
        self.replicator.update_epoch(epoch)
    }

    // ========================================================================
    // Secondary apply
    // ========================================================================

    /// Apply a record received from the primary
    ///
    /// Transaction records go through the same apply path as recovery and
    /// raise notifications with `is_primary = false`.
    pub async fn apply_replicated(&self, record: &LogRecord) -> StateResult<()> {
        self.ensure_open()?;
        if self.role().is_primary() {
            return Err(StateError::invalid_operation(
                "a primary does not apply replicated records",
            ));
        }
        let _barrier = self.manager.commit_barrier().await;
        self.replicator.append_replicated(record)?;
        if let Some(txn) = self
            .state_manager
            .apply_record(record, ApplyContext::Secondary)?
        {
            let lsn = record.lsn();
            self.manager.set_last_committed(lsn);
            self.manager.publish_commit(&txn, lsn);
        }
        debug!(kind = record.kind(), lsn = %record.lsn(), "Replicated record applied");
        Ok(())
    }

    // ========================================================================
    // Checkpoint
    // ========================================================================

    /// Checkpoint now and truncate the log behind it
    pub async fn checkpoint(&self) -> StateResult<Lsn> {
        self.ensure_open()?;
        self.checkpoints.checkpoint(self.backups.log_floor()).await
    }

    fn start_auto_checkpoint(self: &Arc<Self>) {
        let threshold = self.config.checkpoint_threshold;
        if threshold == 0 {
            return;
        }
        let mut task = self.auto_checkpoint.lock();
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }
        let commits = self.manager.subscribe_commits();
        *task = Some(tokio::spawn(auto_checkpoint(
            Arc::downgrade(self),
            commits,
            threshold as i64,
        )));
        debug!(threshold, "Automatic checkpoints started");
    }

    fn stop_auto_checkpoint(&self) {
        if let Some(task) = self.auto_checkpoint.lock().take() {
            task.abort();
            debug!("Automatic checkpoints stopped");
        }
    }

    // ========================================================================
    // Backup, restore, data loss
    // ========================================================================

    /// Take a backup and hand it to `uploader`
    pub async fn backup(
        &self,
        uploader: &dyn BackupUploader,
        option: BackupOption,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<BackupInfo> {
        self.ensure_open()?;
        self.backups.backup(uploader, option, timeout, cancel).await
    }

    /// Replace local state with the backup chain in `folder`
    ///
    /// Outside data loss handling the replica must not be primary. `timeout`
    /// bounds the wait for the rebuild notification to be drained.
    pub async fn restore(
        self: &Arc<Self>,
        folder: &Path,
        policy: RestorePolicy,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<()> {
        self.ensure_open()?;
        if self.role().is_primary() && !self.data_loss_in_flight.load(Ordering::SeqCst) {
            return Err(StateError::invalid_operation(
                "restore requires a replica that is not serving as primary",
            ));
        }
        self.restore_unchecked(folder, policy, timeout, cancel).await
    }

    async fn restore_unchecked(
        self: &Arc<Self>,
        folder: &Path,
        policy: RestorePolicy,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<()> {
        self.ensure_open()?;
        let chain = self.backups.prepare_restore(folder, policy)?;
        cancel.check()?;

        let role = self.role();
        self.stop_auto_checkpoint();
        let tail = self.backups.restore_chain(&chain, cancel).await?;
        self.state_manager.open_all().await?;
        self.state_manager.change_role(role).await?;
        if role.is_primary() {
            self.start_auto_checkpoint();
        }

        self.raise_rebuilt(timeout, cancel).await?;
        info!(
            folder = %folder.display(),
            ?policy,
            lsn = %tail,
            providers = self.state_manager.len(),
            "Replica restored"
        );
        Ok(())
    }

    /// Let the data loss handler restore or accept the current state
    ///
    /// Returns whether the state changed; `false` without a handler. When
    /// the handler reports a change it did not make through
    /// [`RestoreContext::restore`], `Rebuilt` is raised here.
    pub async fn on_data_loss(self: &Arc<Self>) -> StateResult<bool> {
        self.ensure_open()?;
        let Some(handler) = self.data_loss_handler.clone() else {
            info!("Data loss declared, no handler registered; keeping current state");
            return Ok(false);
        };
        if self.data_loss_in_flight.swap(true, Ordering::SeqCst) {
            return Err(StateError::invalid_operation(
                "data loss handling is already in flight",
            ));
        }
        self.restored_during_data_loss.store(false, Ordering::SeqCst);
        warn!(epoch = %self.epoch(), lsn = %self.last_committed_lsn(), "Data loss declared");

        let result = handler
            .on_data_loss(RestoreContext {
                replica: Arc::clone(self),
            })
            .await;
        self.data_loss_in_flight.store(false, Ordering::SeqCst);
        let changed = result?;

        if changed && !self.restored_during_data_loss.load(Ordering::SeqCst) {
            self.raise_rebuilt(self.config.default_timeout(), &CancellationToken::none())
                .await?;
        }
        info!(changed, "Data loss handled");
        Ok(changed)
    }

    /// Raise `Rebuilt` on the namespace, then on every provider
    ///
    /// Provider notifications follow once the namespace enumerator is
    /// drained, so handlers registered while draining see them.
    pub(crate) async fn raise_rebuilt(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<()> {
        if let Some(drained) = self.state_manager.raise_rebuilt() {
            with_deadline(
                async {
                    let _ = drained.await;
                    Ok(())
                },
                timeout,
                cancel,
                "namespace rebuild",
            )
            .await?;
        }
        let providers = self.state_manager.providers();
        for provider in &providers {
            provider.raise_rebuilt();
        }
        debug!(providers = providers.len(), "Rebuild notifications raised");
        Ok(())
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close every provider, flush the log and release the directory lock
    ///
    /// Idempotent.
    pub async fn close(&self) -> StateResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_auto_checkpoint();
        self.replicator.set_role(ReplicaRole::None);
        let closed = self.state_manager.close_all().await;
        self.replicator.log().flush()?;
        self.lock_file.lock().take();
        info!(path = %self.path.display(), "Replica closed");
        closed
    }
}

async fn auto_checkpoint(
    replica: Weak<Replica>,
    mut commits: tokio::sync::watch::Receiver<Lsn>,
    threshold: i64,
) {
    while commits.changed().await.is_ok() {
        let lsn = *commits.borrow_and_update();
        let Some(replica) = replica.upgrade() else {
            break;
        };
        let since = lsn.as_i64() - replica.checkpoints.last_checkpoint_lsn().as_i64();
        if since < threshold || replica.is_closed() {
            continue;
        }
        match replica.checkpoint().await {
            Ok(at) => debug!(lsn = %at, "Automatic checkpoint taken"),
            Err(e) => warn!(error = %e, "Automatic checkpoint failed"),
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        if let Some(task) = self.auto_checkpoint.get_mut().take() {
            task.abort();
        }
        let _ = self.replicator.log().flush();
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("path", &self.path)
            .field("role", &self.role())
            .field("epoch", &self.epoch())
            .field("last_committed", &self.last_committed_lsn())
            .field("closed", &self.is_closed())
            .finish()
    }
}
