//! State manager: the replica's namespace of state providers
//!
//! # Registry
//!
//! The committed namespace is a `BTreeMap` from name to provider behind a
//! parking_lot RwLock. `get` and enumeration read it directly; adds and
//! removes are buffered per transaction ([`NamespaceTransaction`]) and only
//! touch the registry when their transaction's commit is applied.
//!
//! # Ids
//!
//! Provider ids come from a counter starting at [`StateProviderId::FIRST`];
//! id 0 addresses the state manager itself in the log. A provider with
//! children (the compatibility dictionary) reserves consecutive ids for them
//! at creation.
//!
//! # Typed access
//!
//! Providers are held as `Arc<dyn StateProvider>`. [`StateManager::get_store`]
//! downcasts to `Store<K, V>`, looking through a compatibility dictionary to
//! its child store.

pub mod compat;
pub mod factory;
pub mod namespace;
pub mod notification;

use crate::state_manager::factory::ProviderFactories;
use crate::state_manager::namespace::{
    decode_namespace_operations, provider_tree, retire_tree, LoggedProvider, NamespaceOperation,
    NamespaceTransaction, PendingChange, PendingLookup,
};
use crate::state_manager::notification::{
    NamespaceChange, NamespaceChangeKind, NamespaceEnumerator, StateManagerChangeHandler,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use replistate_concurrency::{
    ApplyContext, LockManager, LockMode, ProviderContext, ProviderLifecycle, ReplicatedApply,
    StateProvider, Transaction, TransactionManager,
};
use replistate_core::{
    CancellationToken, Cleanup, Completion, Epoch, HandlerSlot, Limits, Lsn, ReplicaRole,
    StateError, StateProviderId, StateProviderName, StateResult, StoreKey, StoreValue,
    TransactionId, TypeDescriptor,
};
use replistate_durability::{LogRecord, MetadataCheckpoint, MetadataEntry};
use replistate_storage::Store;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

struct RegistryEntry {
    provider: Arc<dyn StateProvider>,
    parent_id: Option<StateProviderId>,
}

#[derive(Default)]
struct Registry {
    by_name: BTreeMap<StateProviderName, RegistryEntry>,
    by_id: HashMap<StateProviderId, StateProviderName>,
}

impl Registry {
    fn insert_tree(&mut self, root: &Arc<dyn StateProvider>) {
        for (provider, parent_id) in provider_tree(root) {
            self.by_id.insert(provider.id(), provider.name().clone());
            self.by_name.insert(
                provider.name().clone(),
                RegistryEntry {
                    provider,
                    parent_id,
                },
            );
        }
    }

    fn remove_ids(&mut self, ids: &[StateProviderId]) {
        for id in ids {
            if let Some(name) = self.by_id.remove(id) {
                self.by_name.remove(&name);
            }
        }
    }

    fn by_id(&self, id: StateProviderId) -> Option<Arc<dyn StateProvider>> {
        self.by_id
            .get(&id)
            .and_then(|name| self.by_name.get(name))
            .map(|entry| Arc::clone(&entry.provider))
    }
}

/// Downcast a provider to `Store<K, V>`
///
/// A compatibility dictionary resolves to its child store.
pub fn downcast_store<K: StoreKey, V: StoreValue>(
    provider: Arc<dyn StateProvider>,
) -> StateResult<Arc<Store<K, V>>> {
    let name = provider.name().clone();
    let children = provider.children();
    if let Ok(store) = provider.into_any().downcast::<Store<K, V>>() {
        return Ok(store);
    }
    if let Some(child) = children.into_iter().next() {
        if let Ok(store) = child.into_any().downcast::<Store<K, V>>() {
            return Ok(store);
        }
    }
    Err(StateError::invalid_operation(format!(
        "provider {} is not a Store<{}, {}>",
        name,
        std::any::type_name::<K>(),
        std::any::type_name::<V>()
    )))
}

/// Namespace of state providers
pub struct StateManager {
    this: Weak<StateManager>,
    manager: Arc<TransactionManager>,
    factories: Arc<ProviderFactories>,
    registry: RwLock<Registry>,
    locks: LockManager<StateProviderName>,
    transactions: DashMap<TransactionId, Arc<NamespaceTransaction>>,
    handler: HandlerSlot<dyn StateManagerChangeHandler>,
    limits: Limits,
    default_timeout: Duration,
    next_id: AtomicI64,
}

impl StateManager {
    /// Empty namespace over `manager`
    pub fn new(
        manager: Arc<TransactionManager>,
        factories: Arc<ProviderFactories>,
        limits: Limits,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| StateManager {
            this: this.clone(),
            manager,
            factories,
            registry: RwLock::new(Registry::default()),
            locks: LockManager::new(),
            transactions: DashMap::new(),
            handler: HandlerSlot::new(),
            limits,
            default_timeout,
            next_id: AtomicI64::new(StateProviderId::FIRST.0),
        })
    }

    /// Transaction machinery of the replica
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Provider constructors
    pub fn factories(&self) -> &Arc<ProviderFactories> {
        &self.factories
    }

    /// Timeout applied when callers pass none
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn arc(&self) -> StateResult<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| StateError::ProviderClosed("state manager".to_string()))
    }

    // ========================================================================
    // Namespace transactions
    // ========================================================================

    fn create_or_find_transaction(&self, txn: &Transaction) -> StateResult<Arc<NamespaceTransaction>> {
        txn.ensure_writable()?;
        if let Some(existing) = self.transactions.get(&txn.id()) {
            return Ok(Arc::clone(existing.value()));
        }
        let state_manager = self.arc()?;
        match self.transactions.entry(txn.id()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let ntxn = Arc::new(NamespaceTransaction::new(&state_manager, txn));
                txn.enlist(ntxn.clone())?;
                entry.insert(Arc::clone(&ntxn));
                Ok(ntxn)
            }
        }
    }

    pub(crate) fn release_transaction(&self, id: TransactionId) {
        self.transactions.remove(&id);
        self.locks.release_all(id);
    }

    /// Number of transactions with buffered namespace work
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Run `f` once `txn` holds `name` exclusively
    fn with_name_lock<T, F>(
        &self,
        txn: &Transaction,
        name: StateProviderName,
        timeout: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> Completion<StateResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&StateManager, &NamespaceTransaction, &StateProviderName) -> StateResult<T>
            + Send
            + 'static,
    {
        let prepared = self.arc().and_then(|sm| {
            let ntxn = sm.create_or_find_transaction(txn)?;
            Ok((sm, ntxn, txn.downgrade()))
        });
        let (sm, ntxn, weak_txn) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Completion::ready(Err(e)),
        };
        self.locks
            .acquire(ntxn.id(), name.clone(), LockMode::Exclusive, timeout, cancel)
            .and_then_ok(move |()| {
                let active = weak_txn
                    .upgrade()
                    .map(|txn| txn.ensure_writable())
                    .unwrap_or_else(|| {
                        Err(StateError::TransactionNotActive {
                            state: "Disposed".to_string(),
                        })
                    });
                if let Err(e) = active {
                    // The transaction ended while this call waited.
                    sm.locks.release_all(ntxn.id());
                    return Completion::ready(Err(e));
                }
                Completion::ready(f(&*sm, &*ntxn, &name))
            })
    }

    fn lookup(&self, ntxn: &NamespaceTransaction, name: &StateProviderName) -> Option<Arc<dyn StateProvider>> {
        match ntxn.lookup(name) {
            PendingLookup::Added(provider) => Some(provider),
            PendingLookup::Removed => None,
            PendingLookup::Untouched => self
                .registry
                .read()
                .by_name
                .get(name)
                .map(|entry| Arc::clone(&entry.provider)),
        }
    }

    fn create_provider(
        &self,
        name: StateProviderName,
        descriptor: TypeDescriptor,
    ) -> StateResult<Arc<dyn StateProvider>> {
        let children = descriptor.kind.child_count() as i64;
        let first = self.next_id.fetch_add(1 + children, Ordering::SeqCst);
        let ctx = ProviderContext {
            id: StateProviderId(first),
            name,
            descriptor,
            manager: Arc::clone(&self.manager),
            limits: self.limits,
            default_timeout: self.default_timeout,
            child_ids: (1..=children).map(|i| StateProviderId(first + i)).collect(),
        };
        self.factories.create(ctx)
    }

    fn get_or_add_locked(
        &self,
        ntxn: &NamespaceTransaction,
        name: &StateProviderName,
        descriptor: TypeDescriptor,
        fail_if_exists: bool,
    ) -> StateResult<(Arc<dyn StateProvider>, bool)> {
        if let Some(existing) = self.lookup(ntxn, name) {
            if fail_if_exists {
                return Err(StateError::NameAlreadyExists(name.clone()));
            }
            return Ok((existing, true));
        }
        let provider = self.create_provider(name.clone(), descriptor)?;
        ntxn.buffer_add(Arc::clone(&provider));
        debug!(txn = %ntxn.id(), name = %name, provider_id = %provider.id(), "State provider created");
        Ok((provider, false))
    }

    fn remove_locked(&self, ntxn: &NamespaceTransaction, name: &StateProviderName) -> StateResult<()> {
        let Some(provider) = self.lookup(ntxn, name) else {
            return Err(StateError::NameNotFound(name.clone()));
        };
        let owned = name
            .parent()
            .and_then(|parent| self.lookup(ntxn, &parent))
            .map_or(false, |parent| {
                parent.children().iter().any(|c| c.id() == provider.id())
            });
        if owned {
            return Err(StateError::invalid_operation(format!(
                "{} belongs to its parent and cannot be removed on its own",
                name
            )));
        }
        ntxn.buffer_remove(provider);
        Ok(())
    }

    // ========================================================================
    // Public namespace API
    // ========================================================================

    /// Find `name`, or create it from `descriptor` inside `txn`
    ///
    /// Returns the provider and whether it already existed. A created
    /// provider is usable inside `txn` at once and registered for everyone
    /// else when `txn` commits.
    pub fn get_or_add(
        &self,
        txn: &Transaction,
        name: StateProviderName,
        descriptor: TypeDescriptor,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<(Arc<dyn StateProvider>, bool)>> {
        self.with_name_lock(txn, name, timeout, cancel, move |sm, ntxn, name| {
            sm.get_or_add_locked(ntxn, name, descriptor, false)
        })
    }

    /// Create `name` inside `txn`; fails with `NameAlreadyExists` if present
    pub fn add(
        &self,
        txn: &Transaction,
        name: StateProviderName,
        descriptor: TypeDescriptor,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<Arc<dyn StateProvider>>> {
        self.with_name_lock(txn, name, timeout, cancel, move |sm, ntxn, name| {
            sm.get_or_add_locked(ntxn, name, descriptor, true)
                .map(|(provider, _)| provider)
        })
    }

    /// Remove `name` (and its children) inside `txn`
    ///
    /// Fails with `NameNotFound` if absent. The provider refuses operations
    /// once `txn` commits.
    pub fn remove(
        &self,
        txn: &Transaction,
        name: StateProviderName,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Completion<StateResult<()>> {
        self.with_name_lock(txn, name, timeout, cancel, |sm, ntxn, name| {
            sm.remove_locked(ntxn, name)
        })
    }

    /// Committed provider registered under `name`
    pub fn get(&self, name: &StateProviderName) -> StateResult<Arc<dyn StateProvider>> {
        self.registry
            .read()
            .by_name
            .get(name)
            .map(|entry| Arc::clone(&entry.provider))
            .ok_or_else(|| StateError::NameNotFound(name.clone()))
    }

    /// Committed `Store<K, V>` registered under `name`
    pub fn get_store<K: StoreKey, V: StoreValue>(
        &self,
        name: &StateProviderName,
    ) -> StateResult<Arc<Store<K, V>>> {
        downcast_store(self.get(name)?)
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &StateProviderName) -> bool {
        self.registry.read().by_name.contains_key(name)
    }

    /// Number of registered providers, children included
    pub fn len(&self) -> usize {
        self.registry.read().by_name.len()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.registry.read().by_name.is_empty()
    }

    /// Committed namespace in name order
    ///
    /// With `parents_only`, providers owned by another provider are skipped.
    pub fn enumerate(
        &self,
        parents_only: bool,
    ) -> std::vec::IntoIter<(StateProviderName, Arc<dyn StateProvider>)> {
        self.registry
            .read()
            .by_name
            .iter()
            .filter(|(_, entry)| !parents_only || entry.parent_id.is_none())
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.provider)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Register the namespace change handler, replacing any previous one
    pub fn set_change_handler(
        &self,
        handler: Arc<dyn StateManagerChangeHandler>,
        cleanup: Option<Cleanup>,
    ) {
        self.handler.set(handler, cleanup);
    }

    /// Remove the namespace change handler
    pub fn clear_change_handler(&self) {
        self.handler.clear();
    }

    // ========================================================================
    // Commit, replay and recovery
    // ========================================================================

    pub(crate) fn apply_change(&self, change: &PendingChange, lsn: Lsn) {
        match change.kind {
            NamespaceChangeKind::Added => self.registry.write().insert_tree(&change.root),
            NamespaceChangeKind::Removed => {
                let ids: Vec<StateProviderId> =
                    provider_tree(&change.root).iter().map(|(p, _)| p.id()).collect();
                self.registry.write().remove_ids(&ids);
                retire_tree(&change.root);
            }
        }
        debug!(
            lsn = %lsn,
            kind = ?change.kind,
            name = %change.root.name(),
            provider_id = %change.root.id(),
            "Namespace change applied"
        );
    }

    pub(crate) fn notify_change(
        &self,
        txn: &Transaction,
        kind: NamespaceChangeKind,
        provider: &Arc<dyn StateProvider>,
        lsn: Lsn,
        is_primary: bool,
    ) {
        if let Some(handler) = self.handler.get() {
            handler.on_change(NamespaceChange {
                transaction: txn.clone(),
                kind,
                name: provider.name().clone(),
                provider: Arc::clone(provider),
                lsn,
                is_primary,
            });
        }
    }

    fn instantiate(&self, entries: &[LoggedProvider]) -> StateResult<Arc<dyn StateProvider>> {
        let Some(root) = entries.first() else {
            return Err(StateError::corruption("namespace add without entries"));
        };
        let descriptor = TypeDescriptor::decode(&root.type_descriptor)?;
        let name = StateProviderName::new(root.name.clone())?;
        let child_ids: Vec<StateProviderId> = entries
            .iter()
            .filter(|e| e.parent_id == Some(root.id))
            .map(|e| e.id)
            .collect();
        let highest = entries.iter().map(|e| e.id.0).max().unwrap_or(root.id.0);
        self.next_id.fetch_max(highest + 1, Ordering::SeqCst);
        self.factories.create(ProviderContext {
            id: root.id,
            name,
            descriptor,
            manager: Arc::clone(&self.manager),
            limits: self.limits,
            default_timeout: self.default_timeout,
            child_ids,
        })
    }

    /// Apply one logged transaction record to the namespace and its providers
    ///
    /// Operations for id 0 change the namespace; the rest go to the provider
    /// registered under their id. Operations for unknown ids (a provider
    /// removed later in the log) are skipped. Returns the replayed
    /// transaction, or `None` for bookkeeping records.
    pub fn apply_record(
        &self,
        record: &LogRecord,
        context: ApplyContext,
    ) -> StateResult<Option<Transaction>> {
        let LogRecord::Transaction {
            txn_id,
            lsn,
            operations,
            ..
        } = record
        else {
            return Ok(None);
        };
        let txn = self.manager.replicated_transaction(*txn_id, *lsn);
        for operation in operations {
            if operation.provider_id == StateProviderId::STATE_MANAGER {
                self.apply(&txn, *lsn, &operation.payload, context)?;
                continue;
            }
            let provider = self.registry.read().by_id(operation.provider_id);
            match provider {
                Some(provider) => provider.apply(&txn, *lsn, &operation.payload, context)?,
                None => warn!(
                    lsn = %lsn,
                    provider_id = %operation.provider_id,
                    "Skipping operation for unknown provider"
                ),
            }
        }
        trace!(txn = %txn_id, lsn = %lsn, ?context, "Transaction record applied");
        Ok(Some(txn))
    }

    /// Rebuild the namespace from a metadata checkpoint
    ///
    /// Providers come back empty; their own checkpoints are recovered
    /// separately.
    pub fn recover_metadata(&self, metadata: &MetadataCheckpoint) -> StateResult<()> {
        let mut children: HashMap<StateProviderId, Vec<&MetadataEntry>> = HashMap::new();
        for entry in &metadata.entries {
            if let Some(parent) = entry.parent_id {
                children.entry(parent).or_default().push(entry);
            }
        }
        let mut recovered = Vec::new();
        for root in metadata.entries.iter().filter(|e| e.parent_id.is_none()) {
            let mut entries = vec![LoggedProvider::from(root)];
            let mut owned = children.remove(&root.id).unwrap_or_default();
            owned.sort_by_key(|e| e.id);
            entries.extend(owned.into_iter().map(LoggedProvider::from));
            recovered.push(self.instantiate(&entries)?);
        }
        if let Some(orphan) = children.keys().next() {
            return Err(StateError::corruption(format!(
                "metadata checkpoint lists children of unknown provider {}",
                orphan
            )));
        }

        let mut registry = self.registry.write();
        for root in &recovered {
            registry.insert_tree(root);
        }
        drop(registry);
        self.next_id
            .fetch_max(metadata.next_provider_id.0, Ordering::SeqCst);
        info!(
            lsn = %metadata.checkpoint_lsn,
            providers = metadata.entries.len(),
            "Namespace recovered from checkpoint"
        );
        Ok(())
    }

    /// Describe the committed namespace for a checkpoint at `lsn`
    pub fn metadata_checkpoint(&self, lsn: Lsn, epoch: Epoch) -> MetadataCheckpoint {
        let registry = self.registry.read();
        let mut entries: Vec<MetadataEntry> = registry
            .by_name
            .values()
            .map(|entry| MetadataEntry {
                name: entry.provider.name().to_string(),
                id: entry.provider.id(),
                type_descriptor: entry.provider.type_descriptor().encode(),
                parent_id: entry.parent_id,
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        MetadataCheckpoint {
            checkpoint_lsn: lsn,
            epoch,
            next_provider_id: StateProviderId(self.next_id.load(Ordering::SeqCst)),
            entries,
        }
    }

    /// Every registered provider, children included, in id order
    pub fn providers(&self) -> Vec<Arc<dyn StateProvider>> {
        let mut providers: Vec<Arc<dyn StateProvider>> = self
            .registry
            .read()
            .by_name
            .values()
            .map(|entry| Arc::clone(&entry.provider))
            .collect();
        providers.sort_by_key(|p| p.id());
        providers
    }

    /// Ids of every registered provider
    pub fn provider_ids(&self) -> Vec<StateProviderId> {
        self.providers().iter().map(|p| p.id()).collect()
    }

    /// Provider registered under `id`
    pub fn provider_by_id(&self, id: StateProviderId) -> Option<Arc<dyn StateProvider>> {
        self.registry.read().by_id(id)
    }

    /// Open every provider
    pub async fn open_all(&self) -> StateResult<()> {
        for provider in self.providers() {
            provider.open().await?;
        }
        Ok(())
    }

    /// Propagate a role change to every provider
    pub async fn change_role(&self, role: ReplicaRole) -> StateResult<()> {
        for provider in self.providers() {
            provider.change_role(role).await?;
        }
        debug!(?role, providers = self.len(), "Providers changed role");
        Ok(())
    }

    /// Close every provider and empty the namespace
    ///
    /// Every provider is closed even if one fails; the first failure is
    /// returned.
    pub async fn close_all(&self) -> StateResult<()> {
        let providers = self.providers();
        *self.registry.write() = Registry::default();
        let mut first_error = None;
        for provider in &providers {
            if let Err(e) = provider.close().await {
                warn!(provider_id = %provider.id(), error = %e, "Closing provider failed");
                first_error.get_or_insert(e);
            }
        }
        info!(providers = providers.len(), "Namespace closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Hand the whole namespace to the change handler
    ///
    /// Returns a receiver that resolves once the handler has drained or
    /// completed the enumerator, or `None` when no handler is registered.
    pub fn raise_rebuilt(&self) -> Option<oneshot::Receiver<()>> {
        let handler = self.handler.get()?;
        let (done, drained) = oneshot::channel();
        let entries = self.enumerate(false).collect();
        handler.on_rebuilt(NamespaceEnumerator::new(entries, Some(done)));
        Some(drained)
    }
}

impl ReplicatedApply for StateManager {
    fn apply(
        &self,
        txn: &Transaction,
        lsn: Lsn,
        payload: &[u8],
        context: ApplyContext,
    ) -> StateResult<()> {
        for operation in decode_namespace_operations(payload)? {
            match operation {
                NamespaceOperation::Add { entries } => {
                    let Some(root_id) = entries.first().map(|e| e.id) else {
                        continue;
                    };
                    if self.registry.read().by_id.contains_key(&root_id) {
                        trace!(lsn = %lsn, provider_id = %root_id, "Provider already registered");
                        continue;
                    }
                    let root = self.instantiate(&entries)?;
                    self.registry.write().insert_tree(&root);
                    debug!(lsn = %lsn, name = %root.name(), provider_id = %root_id, "Provider registered from log");
                    if context == ApplyContext::Secondary {
                        self.notify_change(txn, NamespaceChangeKind::Added, &root, lsn, false);
                    }
                }
                NamespaceOperation::Remove { ids } => {
                    let root = ids.first().and_then(|id| self.registry.read().by_id(*id));
                    let Some(root) = root else {
                        continue;
                    };
                    self.registry.write().remove_ids(&ids);
                    retire_tree(&root);
                    debug!(lsn = %lsn, name = %root.name(), "Provider unregistered from log");
                    if context == ApplyContext::Secondary {
                        self.notify_change(txn, NamespaceChangeKind::Removed, &root, lsn, false);
                    }
                }
            }
        }
        Ok(())
    }
}

impl From<&MetadataEntry> for LoggedProvider {
    fn from(entry: &MetadataEntry) -> Self {
        LoggedProvider {
            name: entry.name.clone(),
            id: entry.id,
            type_descriptor: entry.type_descriptor.clone(),
            parent_id: entry.parent_id,
        }
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("providers", &self.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::factory::{compat_descriptor, store_descriptor};
    use super::*;
    use parking_lot::Mutex;
    use replistate_concurrency::LoggingReplicator;
    use replistate_core::DEFAULT_TIMEOUT;
    use replistate_durability::MemoryLog;

    const T: Duration = Duration::from_secs(2);

    fn state_manager() -> Arc<StateManager> {
        let replicator = Arc::new(LoggingReplicator::new(Arc::new(MemoryLog::new())));
        replicator.set_role(ReplicaRole::Primary);
        let manager = TransactionManager::new(replicator);
        let factories = Arc::new(ProviderFactories::new());
        factories.register_store::<String, String>("String:String");
        StateManager::new(manager, factories, Limits::default(), DEFAULT_TIMEOUT)
    }

    fn name(s: &str) -> StateProviderName {
        StateProviderName::new(s).unwrap()
    }

    fn none() -> CancellationToken {
        CancellationToken::none()
    }

    #[derive(Default)]
    struct Changes(Mutex<Vec<(NamespaceChangeKind, String, bool)>>);

    impl StateManagerChangeHandler for Changes {
        fn on_change(&self, change: NamespaceChange) {
            self.0
                .lock()
                .push((change.kind, change.name.to_string(), change.is_primary));
        }

        fn on_rebuilt(&self, _providers: NamespaceEnumerator) {}
    }

    #[tokio::test]
    async fn test_get_or_add_creates_then_finds() {
        let sm = state_manager();
        let txn = sm.manager().create_transaction();
        let (created, existed) = sm
            .get_or_add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        assert!(!existed);
        assert_eq!(created.id(), StateProviderId::FIRST);
        assert!(!sm.contains(&name("fabric:/a")), "visible before commit");

        let (again, existed) = sm
            .get_or_add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        assert!(existed, "same transaction sees its own add");
        assert_eq!(again.id(), created.id());

        txn.commit().await.unwrap();
        assert_eq!(sm.get(&name("fabric:/a")).unwrap().id(), created.id());
        assert_eq!(sm.active_transactions(), 0);

        let txn = sm.manager().create_transaction();
        let (_, existed) = sm
            .get_or_add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        assert!(existed);
    }

    #[tokio::test]
    async fn test_add_and_remove_errors() {
        let sm = state_manager();
        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let txn = sm.manager().create_transaction();
        let err = sm
            .add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StateError::NameAlreadyExists(_)));

        let err = sm
            .remove(&txn, name("fabric:/missing"), T, &none())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NameNotFound(_)));
        assert!(matches!(
            sm.get(&name("fabric:/missing")).err().unwrap(),
            StateError::NameNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_abort_leaves_namespace_untouched() {
        let sm = state_manager();
        let txn = sm.manager().create_transaction();
        let (provider, _) = sm
            .get_or_add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        txn.abort();
        assert!(sm.is_empty());
        assert!(provider.is_closed());
        assert_eq!(sm.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_remove_retires_provider_on_commit() {
        let sm = state_manager();
        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/a"), store_descriptor("String:String"), T, &none())
            .await
            .unwrap();
        txn.commit().await.unwrap();
        let store = sm.get_store::<String, String>(&name("fabric:/a")).unwrap();

        let txn = sm.manager().create_transaction();
        sm.remove(&txn, name("fabric:/a"), T, &none()).await.unwrap();
        assert!(!store.is_closed(), "removal is not visible before commit");
        assert!(sm.contains(&name("fabric:/a")));
        txn.commit().await.unwrap();

        assert!(store.is_closed());
        assert!(!sm.contains(&name("fabric:/a")));
        let late = sm.manager().create_transaction();
        assert!(matches!(
            store.create_or_find_transaction(&late).unwrap_err(),
            StateError::ProviderClosed(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_of_own_add_cancels_out() {
        let sm = state_manager();
        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        sm.remove(&txn, name("fabric:/a"), T, &none()).await.unwrap();
        let before = sm.manager().last_committed_lsn();
        let lsn = txn.commit().await.unwrap();
        assert_eq!(lsn, before, "nothing was logged");
        assert!(sm.is_empty());
    }

    #[tokio::test]
    async fn test_compat_dictionary_registers_child() {
        let sm = state_manager();
        let txn = sm.manager().create_transaction();
        let parent = sm
            .add(&txn, name("fabric:/d"), compat_descriptor("String:String"), T, &none())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(sm.len(), 2);
        let child = sm.get(&name("fabric:/d/dataStore")).unwrap();
        assert_eq!(child.id(), StateProviderId(parent.id().0 + 1));

        let parents: Vec<String> = sm.enumerate(true).map(|(n, _)| n.to_string()).collect();
        assert_eq!(parents, vec!["fabric:/d".to_string()]);
        assert_eq!(sm.enumerate(false).count(), 2);

        let through_parent = sm.get_store::<String, String>(&name("fabric:/d")).unwrap();
        assert_eq!(through_parent.id(), child.id());

        let txn = sm.manager().create_transaction();
        let err = sm
            .remove(&txn, name("fabric:/d/dataStore"), T, &none())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidOperation(_)));
        sm.remove(&txn, name("fabric:/d"), T, &none()).await.unwrap();
        txn.commit().await.unwrap();
        assert!(sm.is_empty());
    }

    #[tokio::test]
    async fn test_notifications_follow_commit() {
        let sm = state_manager();
        let changes = Arc::new(Changes::default());
        sm.set_change_handler(changes.clone(), None);

        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        assert!(changes.0.lock().is_empty());
        txn.commit().await.unwrap();

        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/b"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        txn.abort();

        let txn = sm.manager().create_transaction();
        sm.remove(&txn, name("fabric:/a"), T, &none()).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(
            *changes.0.lock(),
            vec![
                (NamespaceChangeKind::Added, "fabric:/a".to_string(), true),
                (NamespaceChangeKind::Removed, "fabric:/a".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_get_or_add_has_one_creator() {
        let sm = state_manager();
        let first = sm.manager().create_transaction();
        let (created, existed) = sm
            .get_or_add(&first, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        assert!(!existed);

        let second = sm.manager().create_transaction();
        let waiting = sm.get_or_add(&second, name("fabric:/a"), TypeDescriptor::store(), T, &none());
        assert!(!waiting.is_synchronous());
        let waiter = tokio::spawn(async move { waiting.await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        first.commit().await.unwrap();

        let (found, existed) = waiter.await.unwrap().unwrap();
        assert!(existed);
        assert_eq!(found.id(), created.id());
        second.commit().await.unwrap();
        assert_eq!(sm.len(), 1);
    }

    #[tokio::test]
    async fn test_name_lock_times_out() {
        let sm = state_manager();
        let first = sm.manager().create_transaction();
        sm.add(&first, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();

        let second = sm.manager().create_transaction();
        let err = sm
            .get_or_add(
                &second,
                name("fabric:/a"),
                TypeDescriptor::store(),
                Duration::from_millis(30),
                &none(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StateError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let sm = state_manager();
        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/a"), store_descriptor("String:String"), T, &none())
            .await
            .unwrap();
        sm.add(&txn, name("fabric:/d"), compat_descriptor("String:String"), T, &none())
            .await
            .unwrap();
        let lsn = txn.commit().await.unwrap();
        let metadata = sm.metadata_checkpoint(lsn, Epoch::default());
        assert_eq!(metadata.entries.len(), 3);

        let recovered = state_manager();
        recovered.recover_metadata(&metadata).unwrap();
        assert_eq!(recovered.provider_ids(), sm.provider_ids());
        assert!(recovered
            .get_store::<String, String>(&name("fabric:/a"))
            .is_ok());
        assert!(recovered
            .get_store::<String, String>(&name("fabric:/d"))
            .is_ok());

        let txn = recovered.manager().create_transaction();
        let created = recovered
            .add(&txn, name("fabric:/e"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        assert_eq!(created.id(), metadata.next_provider_id);
    }

    #[tokio::test]
    async fn test_log_replay_registers_once() {
        let sm = state_manager();
        let changes = Arc::new(Changes::default());
        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        txn.commit().await.unwrap();
        assert_eq!(sm.manager().replicator().tail_lsn(), Lsn::new(1));

        let replica = state_manager();
        replica.set_change_handler(changes.clone(), None);
        let metadata = sm.metadata_checkpoint(Lsn::new(1), Epoch::default());
        let payload = add_payload(&metadata);
        let record = LogRecord::Transaction {
            txn_id: TransactionId(7),
            lsn: Lsn::new(1),
            epoch: Epoch::default(),
            operations: vec![replistate_durability::ProviderOperation::new(
                StateProviderId::STATE_MANAGER,
                payload,
            )],
        };
        replica.apply_record(&record, ApplyContext::Secondary).unwrap();
        replica.apply_record(&record, ApplyContext::Secondary).unwrap();
        assert_eq!(replica.len(), 1);
        assert_eq!(
            *changes.0.lock(),
            vec![(NamespaceChangeKind::Added, "fabric:/a".to_string(), false)]
        );
    }

    fn add_payload(metadata: &MetadataCheckpoint) -> Vec<u8> {
        let entries = metadata.entries.iter().map(LoggedProvider::from).collect();
        namespace::encode_namespace_operations(&[NamespaceOperation::Add { entries }]).unwrap()
    }

    #[tokio::test]
    async fn test_rebuilt_waits_for_drain() {
        struct Draining;
        impl StateManagerChangeHandler for Draining {
            fn on_change(&self, _change: NamespaceChange) {}
            fn on_rebuilt(&self, providers: NamespaceEnumerator) {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    assert_eq!(providers.count(), 1);
                });
            }
        }

        let sm = state_manager();
        assert!(sm.raise_rebuilt().is_none());
        let txn = sm.manager().create_transaction();
        sm.add(&txn, name("fabric:/a"), TypeDescriptor::store(), T, &none())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        sm.set_change_handler(Arc::new(Draining), None);
        let drained = sm.raise_rebuilt().unwrap();
        tokio::time::timeout(T, drained).await.unwrap().unwrap();
    }
}
