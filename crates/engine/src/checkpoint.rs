//! Replica-wide checkpoints and checkpoint recovery
//!
//! A checkpoint drives every registered provider through the three phases
//! and writes the namespace alongside:
//!
//! ```text
//! [commit barrier]  lsn = last committed; prepare(lsn) on every provider;
//!                   snapshot namespace metadata
//! perform           provider files -> <id>.chk.next, metadata -> sm.chk.next
//! complete          rename every .next file over its baseline
//! cleanup           drop files of removed providers, log Checkpoint(lsn),
//!                   truncate the log head
//! ```
//!
//! Until the rename, the previous checkpoint stays the recovery baseline; a
//! failure deletes the staged files and leaves the log untouched.

use crate::state_manager::StateManager;
use replistate_concurrency::{Checkpointable, LoggingReplicator, TransactionalReplicator};
use replistate_core::{Lsn, StateError, StateResult};
use replistate_durability::{
    publish, read_metadata_checkpoint, write_metadata_checkpoint, CheckpointLayout, LogRecord,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, error, info};

/// Runs checkpoints for one replica
pub struct CheckpointManager {
    state_manager: Arc<StateManager>,
    replicator: Arc<LoggingReplicator>,
    layout: CheckpointLayout,
    running: AsyncMutex<()>,
    last_checkpoint: AtomicI64,
}

impl CheckpointManager {
    /// Checkpoints of `state_manager` written under `layout`
    pub fn new(
        state_manager: Arc<StateManager>,
        replicator: Arc<LoggingReplicator>,
        layout: CheckpointLayout,
    ) -> Self {
        CheckpointManager {
            state_manager,
            replicator,
            layout,
            running: AsyncMutex::new(()),
            last_checkpoint: AtomicI64::new(Lsn::ZERO.as_i64()),
        }
    }

    /// Checkpoint directory
    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    /// Boundary of the last completed checkpoint
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        Lsn::new(self.last_checkpoint.load(Ordering::SeqCst))
    }

    /// Take a checkpoint and truncate the log behind it
    ///
    /// Log records above `log_floor` survive truncation even when the
    /// checkpoint covers them. Returns the checkpoint boundary.
    pub async fn checkpoint(&self, log_floor: Option<Lsn>) -> StateResult<Lsn> {
        let _running = self.running.lock().await;
        let manager = self.state_manager.manager();

        let (lsn, metadata, providers) = {
            let _barrier = manager.commit_barrier().await;
            let lsn = manager.last_committed_lsn();
            let providers = self.state_manager.providers();
            for provider in &providers {
                provider.prepare_checkpoint(lsn)?;
            }
            let metadata = self
                .state_manager
                .metadata_checkpoint(lsn, self.replicator.epoch());
            (lsn, metadata, providers)
        };
        debug!(lsn = %lsn, providers = providers.len(), "Checkpoint prepared");

        let written = async {
            self.layout.create()?;
            for provider in &providers {
                provider.perform_checkpoint(&self.layout).await?;
            }
            write_metadata_checkpoint(&self.layout.metadata_staged(), &metadata)
                .map_err(|e| StateError::checkpoint_failed(lsn, e))?;
            for provider in &providers {
                provider.complete_checkpoint(&self.layout).await?;
            }
            publish(&self.layout.metadata_staged(), &self.layout.metadata())
                .map_err(|e| StateError::checkpoint_failed(lsn, e))
        }
        .await;
        if let Err(e) = written {
            error!(lsn = %lsn, error = %e, "Checkpoint failed, previous checkpoint kept");
            if let Err(cleanup) = self.layout.remove_staged() {
                error!(error = %cleanup, "Removing staged checkpoint files failed");
            }
            return Err(e);
        }
        self.last_checkpoint.fetch_max(lsn.as_i64(), Ordering::SeqCst);

        let live: Vec<_> = providers.iter().map(|p| p.id()).collect();
        self.layout.remove_orphans(&live)?;

        let log = self.replicator.log();
        log.append(&LogRecord::Checkpoint { lsn })?;
        let cut = log_floor.map_or(lsn, |floor| floor.min(lsn));
        if cut > log.truncated_through() {
            log.truncate_head(cut)?;
            debug!(up_to = %cut, "Log head truncated");
        }

        info!(lsn = %lsn, providers = providers.len(), "Checkpoint completed");
        Ok(lsn)
    }

    /// Load the published checkpoint into the state manager
    ///
    /// Staged leftovers of an interrupted checkpoint are deleted first.
    /// Returns the checkpoint boundary (`Lsn::ZERO` when there is none).
    pub async fn recover(&self) -> StateResult<Lsn> {
        let _running = self.running.lock().await;
        self.recover_paused().await
    }

    /// Hold off checkpoints until the guard drops
    ///
    /// Take this before the commit barrier, in the same order `checkpoint`
    /// takes them.
    pub(crate) async fn pause(&self) -> AsyncMutexGuard<'_, ()> {
        self.running.lock().await
    }

    /// [`recover`](Self::recover) for a caller already holding [`pause`](Self::pause)
    pub(crate) async fn recover_paused(&self) -> StateResult<Lsn> {
        self.layout.create()?;
        let removed = self.layout.remove_staged()?;
        if removed > 0 {
            info!(files = removed, "Removed staged files of an interrupted checkpoint");
        }
        if !self.layout.has_checkpoint() {
            debug!("No checkpoint to recover");
            self.last_checkpoint.store(Lsn::ZERO.as_i64(), Ordering::SeqCst);
            return Ok(Lsn::ZERO);
        }

        let metadata = read_metadata_checkpoint(&self.layout.metadata())?;
        self.state_manager.recover_metadata(&metadata)?;
        for provider in self.state_manager.providers() {
            provider.recover_checkpoint(&self.layout).await?;
        }
        self.last_checkpoint
            .store(metadata.checkpoint_lsn.as_i64(), Ordering::SeqCst);
        info!(
            lsn = %metadata.checkpoint_lsn,
            epoch = %metadata.epoch,
            providers = metadata.entries.len(),
            "Checkpoint recovered"
        );
        Ok(metadata.checkpoint_lsn)
    }

    /// Replace the checkpoint directory with the files in `source`
    pub fn replace_with(&self, source: &std::path::Path) -> StateResult<usize> {
        if self.layout.dir().exists() {
            std::fs::remove_dir_all(self.layout.dir())?;
        }
        self.layout.create()?;
        let copied = CheckpointLayout::new(source).copy_published(self.layout.dir())?;
        debug!(files = copied, source = %source.display(), "Checkpoint directory replaced");
        Ok(copied)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("dir", &self.layout.dir())
            .field("last_checkpoint", &self.last_checkpoint_lsn())
            .finish()
    }
}
