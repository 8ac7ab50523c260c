//! State provider capabilities
//!
//! A state provider is a replicated, checkpointable unit of state registered
//! under a name in the state manager. Its capabilities are split into small
//! traits and composed by [`StateProvider`]:
//!
//! - [`ProviderLifecycle`]: open, role changes, close
//! - [`Checkpointable`]: three-phase checkpoint and recovery
//! - [`ReplicatedApply`]: replay of logged operations (recovery, secondary)
//! - [`ChangeNotifier`]: rebuild notification after recovery or restore
//!
//! The state manager holds providers as `Arc<dyn StateProvider>` and only
//! downcasts at its typed accessors, where the type descriptor has already
//! selected the concrete type.

use crate::manager::TransactionManager;
use crate::transaction::Transaction;
use async_trait::async_trait;
use replistate_core::{
    Limits, Lsn, ReplicaRole, StateProviderId, StateProviderName, StateResult, TypeDescriptor,
};
use replistate_durability::CheckpointLayout;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Why logged operations are being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyContext {
    /// Replaying the local log after checkpoint recovery
    Recovery,
    /// Applying operations replicated from the primary
    Secondary,
}

/// Open, role change and close
#[async_trait]
pub trait ProviderLifecycle: Send + Sync {
    /// Ready the provider for operations
    async fn open(&self) -> StateResult<()>;

    /// React to a replica role change
    async fn change_role(&self, role: ReplicaRole) -> StateResult<()>;

    /// Refuse further operations and drop in-memory state
    async fn close(&self) -> StateResult<()>;

    /// Refuse further operations at once; used when the provider leaves the
    /// namespace inside a commit, where nothing may await
    fn retire(&self);

    /// Whether the provider has been closed
    fn is_closed(&self) -> bool;
}

/// Three-phase checkpoint and recovery
#[async_trait]
pub trait Checkpointable: Send + Sync {
    /// Fix the checkpoint boundary; called under the commit barrier
    fn prepare_checkpoint(&self, lsn: Lsn) -> StateResult<()>;

    /// Write every record with version at or below the boundary to a staged file
    async fn perform_checkpoint(&self, layout: &CheckpointLayout) -> StateResult<()>;

    /// Publish the staged file as the recovery baseline
    async fn complete_checkpoint(&self, layout: &CheckpointLayout) -> StateResult<()>;

    /// Load the published checkpoint, if any, replacing in-memory state
    async fn recover_checkpoint(&self, layout: &CheckpointLayout) -> StateResult<()>;

    /// LSN of the last completed checkpoint
    fn checkpoint_lsn(&self) -> Lsn;
}

/// Replay of logged operations
pub trait ReplicatedApply: Send + Sync {
    /// Apply one logged payload written by this provider at `lsn`
    fn apply(
        &self,
        txn: &Transaction,
        lsn: Lsn,
        payload: &[u8],
        context: ApplyContext,
    ) -> StateResult<()>;
}

/// Rebuild notification
pub trait ChangeNotifier: Send + Sync {
    /// Tell the registered change handler the whole content was re-materialized
    fn raise_rebuilt(&self);
}

/// A replicated, checkpointable unit of state
pub trait StateProvider:
    ProviderLifecycle + Checkpointable + ReplicatedApply + ChangeNotifier + 'static
{
    /// Registered name
    fn name(&self) -> &StateProviderName;

    /// Registered id
    fn id(&self) -> StateProviderId;

    /// Descriptor the provider was created from
    fn type_descriptor(&self) -> &TypeDescriptor;

    /// Child providers owned by this one
    fn children(&self) -> Vec<Arc<dyn StateProvider>> {
        Vec::new()
    }

    /// For typed access
    fn as_any(&self) -> &dyn Any;

    /// For typed access through an `Arc`
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Everything a provider needs at construction
#[derive(Clone)]
pub struct ProviderContext {
    /// Id assigned by the state manager
    pub id: StateProviderId,
    /// Registered name
    pub name: StateProviderName,
    /// Descriptor selecting the concrete type
    pub descriptor: TypeDescriptor,
    /// Transaction machinery of the replica
    pub manager: Arc<TransactionManager>,
    /// Key and value size limits
    pub limits: Limits,
    /// Timeout for internal lock waits
    pub default_timeout: Duration,
    /// Ids reserved for child providers, in creation order
    pub child_ids: Vec<StateProviderId>,
}

impl ProviderContext {
    /// Context for the `index`-th child, named `<name>/<segment>`
    pub fn child(&self, index: usize, segment: &str) -> StateResult<ProviderContext> {
        let id = self.child_ids.get(index).copied().ok_or_else(|| {
            replistate_core::StateError::invalid_operation(format!(
                "provider {} has no child id reserved at {}",
                self.name, index
            ))
        })?;
        Ok(ProviderContext {
            id,
            name: self.name.child(segment)?,
            descriptor: TypeDescriptor::store(),
            manager: Arc::clone(&self.manager),
            limits: self.limits,
            default_timeout: self.default_timeout,
            child_ids: Vec::new(),
        })
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("child_ids", &self.child_ids)
            .finish()
    }
}
