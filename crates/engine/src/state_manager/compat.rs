//! Compatibility dictionary
//!
//! Providers of kind `ReliableDictionaryCompat` are thin parents that own
//! exactly one child store named `<name>/dataStore`. The child is a regular
//! namespace entry: it is checkpointed, recovered and replayed on its own,
//! and it is what callers read and write. The parent holds no data.

use async_trait::async_trait;
use replistate_concurrency::{
    ApplyContext, ChangeNotifier, Checkpointable, ProviderContext, ProviderLifecycle,
    ReplicatedApply, StateProvider, Transaction,
};
use replistate_core::{
    Lsn, ReplicaRole, StateError, StateProviderId, StateProviderName, StateResult, StoreKey,
    StoreValue, TypeDescriptor,
};
use replistate_durability::CheckpointLayout;
use replistate_storage::Store;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name segment of the child store
pub const DATA_STORE_SEGMENT: &str = "dataStore";

/// Dictionary wrapper owning one child store
pub struct CompatDictionary<K, V> {
    id: StateProviderId,
    name: StateProviderName,
    descriptor: TypeDescriptor,
    data_store: Arc<Store<K, V>>,
    closed: AtomicBool,
}

impl<K: StoreKey, V: StoreValue> CompatDictionary<K, V> {
    /// Create the parent and its child store
    pub fn new(ctx: ProviderContext) -> StateResult<Arc<Self>> {
        let data_store = Store::new(ctx.child(0, DATA_STORE_SEGMENT)?);
        Ok(Arc::new(CompatDictionary {
            id: ctx.id,
            name: ctx.name,
            descriptor: ctx.descriptor,
            data_store,
            closed: AtomicBool::new(false),
        }))
    }

    /// The child store holding the data
    pub fn data_store(&self) -> &Arc<Store<K, V>> {
        &self.data_store
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> ProviderLifecycle for CompatDictionary<K, V> {
    async fn open(&self) -> StateResult<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn change_role(&self, _role: ReplicaRole) -> StateResult<()> {
        Ok(())
    }

    async fn close(&self) -> StateResult<()> {
        self.retire();
        Ok(())
    }

    fn retire(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// The child checkpoints itself; the parent has nothing to write.
#[async_trait]
impl<K: StoreKey, V: StoreValue> Checkpointable for CompatDictionary<K, V> {
    fn prepare_checkpoint(&self, _lsn: Lsn) -> StateResult<()> {
        Ok(())
    }

    async fn perform_checkpoint(&self, _layout: &CheckpointLayout) -> StateResult<()> {
        Ok(())
    }

    async fn complete_checkpoint(&self, _layout: &CheckpointLayout) -> StateResult<()> {
        Ok(())
    }

    async fn recover_checkpoint(&self, _layout: &CheckpointLayout) -> StateResult<()> {
        Ok(())
    }

    fn checkpoint_lsn(&self) -> Lsn {
        self.data_store.checkpoint_lsn()
    }
}

impl<K: StoreKey, V: StoreValue> ReplicatedApply for CompatDictionary<K, V> {
    fn apply(
        &self,
        _txn: &Transaction,
        lsn: Lsn,
        _payload: &[u8],
        _context: ApplyContext,
    ) -> StateResult<()> {
        Err(StateError::corruption(format!(
            "operation at {} addressed to compatibility dictionary {}, which logs none",
            lsn, self.name
        )))
    }
}

impl<K: StoreKey, V: StoreValue> ChangeNotifier for CompatDictionary<K, V> {
    fn raise_rebuilt(&self) {}
}

impl<K: StoreKey, V: StoreValue> StateProvider for CompatDictionary<K, V> {
    fn name(&self) -> &StateProviderName {
        &self.name
    }

    fn id(&self) -> StateProviderId {
        self.id
    }

    fn type_descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    fn children(&self) -> Vec<Arc<dyn StateProvider>> {
        vec![Arc::clone(&self.data_store) as Arc<dyn StateProvider>]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
