//! Store as a state provider: lifecycle, checkpoint, replay, rebuild
//!
//! # Checkpoint phases
//!
//! 1. `prepare_checkpoint(lsn)`: fix the boundary and pin it so versions at
//!    or below it survive until the file is written
//! 2. `perform_checkpoint`: write every live record visible at the boundary
//!    to `<id>.chk.next`
//! 3. `complete_checkpoint`: rename it to `<id>.chk`
//!
//! A failure before step 3 leaves the previous `<id>.chk` untouched.

use crate::operation::decode_operations;
use crate::store::Store;
use async_trait::async_trait;
use replistate_concurrency::{
    ApplyContext, ChangeNotifier, Checkpointable, ProviderLifecycle, ReplicatedApply,
    StateProvider, Transaction,
};
use replistate_core::{
    codec, Lsn, ReplicaRole, StateError, StateProviderId, StateProviderName, StateResult,
    StoreKey, StoreValue, TypeDescriptor, VersionedRecord,
};
use replistate_durability::{
    publish, read_provider_checkpoint, write_provider_checkpoint, CheckpointLayout,
    CheckpointRecord,
};
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
impl<K: StoreKey, V: StoreValue> ProviderLifecycle for Store<K, V> {
    async fn open(&self) -> StateResult<()> {
        self.closed.store(false, Ordering::Release);
        debug!(provider = %self.id(), name = %self.name(), "Store opened");
        Ok(())
    }

    async fn change_role(&self, role: ReplicaRole) -> StateResult<()> {
        *self.role.write() = role;
        debug!(provider = %self.id(), ?role, "Store role changed");
        Ok(())
    }

    async fn close(&self) -> StateResult<()> {
        self.mark_closed();
        Ok(())
    }

    fn retire(&self) {
        self.mark_closed();
    }

    fn is_closed(&self) -> bool {
        Store::is_closed(self)
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> Checkpointable for Store<K, V> {
    fn prepare_checkpoint(&self, lsn: Lsn) -> StateResult<()> {
        let guard = self.manager().snapshots().register(lsn);
        let mut state = self.checkpoint.lock();
        state.prepared = Some(guard);
        state.staged = None;
        debug!(provider = %self.id(), lsn = %lsn, "Checkpoint prepared");
        Ok(())
    }

    async fn perform_checkpoint(&self, layout: &CheckpointLayout) -> StateResult<()> {
        let lsn = match &self.checkpoint.lock().prepared {
            Some(guard) => guard.lsn(),
            None => {
                return Err(StateError::invalid_operation(
                    "perform_checkpoint without prepare_checkpoint",
                ))
            }
        };

        let mut records = Vec::new();
        for (key, record) in self.records_at(lsn) {
            if let Some(value) = record.value() {
                records.push(CheckpointRecord {
                    key: codec::encode(&key)?,
                    version: record.version,
                    value: codec::encode(value)?,
                });
            }
        }
        write_provider_checkpoint(&layout.provider_staged(self.id()), self.id(), lsn, &records)
            .map_err(|e| StateError::checkpoint_failed(lsn, e))?;

        let mut state = self.checkpoint.lock();
        state.staged = Some(lsn);
        state.prepared = None;
        drop(state);
        self.compact();
        Ok(())
    }

    async fn complete_checkpoint(&self, layout: &CheckpointLayout) -> StateResult<()> {
        let Some(lsn) = self.checkpoint.lock().staged else {
            return Err(StateError::invalid_operation(
                "complete_checkpoint without perform_checkpoint",
            ));
        };
        publish(&layout.provider_staged(self.id()), &layout.provider(self.id()))
            .map_err(|e| StateError::checkpoint_failed(lsn, e))?;
        let mut state = self.checkpoint.lock();
        state.staged = None;
        state.completed = lsn;
        info!(provider = %self.id(), lsn = %lsn, "Checkpoint completed");
        Ok(())
    }

    async fn recover_checkpoint(&self, layout: &CheckpointLayout) -> StateResult<()> {
        let path = layout.provider(self.id());
        if !path.exists() {
            self.replace_content(Vec::new());
            self.checkpoint.lock().completed = Lsn::ZERO;
            debug!(provider = %self.id(), "No checkpoint to recover");
            return Ok(());
        }

        let checkpoint = read_provider_checkpoint(&path)?;
        if checkpoint.header.provider_id != self.id() {
            return Err(StateError::corruption(format!(
                "checkpoint {} belongs to provider {}, expected {}",
                path.display(),
                checkpoint.header.provider_id,
                self.id()
            )));
        }
        let mut records = Vec::with_capacity(checkpoint.records.len());
        for record in checkpoint.records {
            let key: K = codec::decode(&record.key)?;
            let value: V = codec::decode(&record.value)?;
            records.push((key, VersionedRecord::new(value, record.version)));
        }
        let count = records.len();
        self.replace_content(records);
        self.checkpoint.lock().completed = checkpoint.header.checkpoint_lsn;
        info!(
            provider = %self.id(),
            lsn = %checkpoint.header.checkpoint_lsn,
            records = count,
            "Checkpoint recovered"
        );
        Ok(())
    }

    fn checkpoint_lsn(&self) -> Lsn {
        self.checkpoint.lock().completed
    }
}

impl<K: StoreKey, V: StoreValue> ReplicatedApply for Store<K, V> {
    fn apply(
        &self,
        txn: &Transaction,
        lsn: Lsn,
        payload: &[u8],
        context: ApplyContext,
    ) -> StateResult<()> {
        if Store::is_closed(self) {
            return Err(StateError::ProviderClosed(self.name().to_string()));
        }
        let operations = decode_operations::<K, V>(payload)?;
        self.apply_operations(&operations, lsn);
        if context == ApplyContext::Secondary {
            self.publish_changes(txn, operations, lsn, false);
        }
        Ok(())
    }
}

impl<K: StoreKey, V: StoreValue> ChangeNotifier for Store<K, V> {
    fn raise_rebuilt(&self) {
        let Some(handler) = self.handler.get() else {
            return;
        };
        match self.snapshot_enumerator() {
            Ok(contents) => handler.on_rebuilt(contents),
            Err(e) => warn!(provider = %self.id(), error = %e, "Rebuild notification skipped"),
        }
    }
}

impl<K: StoreKey, V: StoreValue> StateProvider for Store<K, V> {
    fn name(&self) -> &StateProviderName {
        Store::name(self)
    }

    fn id(&self) -> StateProviderId {
        Store::id(self)
    }

    fn type_descriptor(&self) -> &TypeDescriptor {
        self.descriptor()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
