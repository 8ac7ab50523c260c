//! Namespace changes as a transaction participant
//!
//! Adds and removes are buffered per transaction in a [`NamespaceTransaction`]
//! and logged under provider id 0 as one payload of [`NamespaceOperation`]s.
//! They reach the committed registry only in `apply_committed`, so a failed
//! or aborted transaction leaves the namespace untouched.
//!
//! Every touched name is held in Exclusive mode until the transaction ends,
//! which serializes concurrent `get_or_add` calls for the same name: the
//! second caller waits for the first to commit and then finds its provider.

use super::notification::NamespaceChangeKind;
use super::StateManager;
use parking_lot::Mutex;
use replistate_concurrency::{
    ProviderLifecycle, StateProvider, Transaction, TransactionParticipant, WeakTransaction,
};
use replistate_core::{
    codec, Lsn, StateError, StateProviderId, StateProviderName, StateResult, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::trace;

/// One registered name as it appears in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedProvider {
    /// Full name
    pub name: String,
    /// Assigned id
    pub id: StateProviderId,
    /// Encoded type descriptor
    pub type_descriptor: String,
    /// Owning provider, for children
    pub parent_id: Option<StateProviderId>,
}

/// Logged namespace change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceOperation {
    /// Register a provider; the parent comes first, then its children
    Add {
        /// Parent followed by children
        entries: Vec<LoggedProvider>,
    },
    /// Unregister a provider and its children
    Remove {
        /// Parent followed by children
        ids: Vec<StateProviderId>,
    },
}

/// Encode a namespace payload
pub fn encode_namespace_operations(operations: &[NamespaceOperation]) -> StateResult<Vec<u8>> {
    codec::encode(operations)
}

/// Decode a namespace payload
pub fn decode_namespace_operations(payload: &[u8]) -> StateResult<Vec<NamespaceOperation>> {
    codec::decode(payload)
}

/// A buffered add or remove of one top-level name
#[derive(Clone)]
pub(crate) struct PendingChange {
    pub(crate) kind: NamespaceChangeKind,
    /// Top-level provider
    pub(crate) root: Arc<dyn StateProvider>,
}

impl PendingChange {
    /// Root followed by its children, with parent ids
    pub(crate) fn tree(&self) -> Vec<(Arc<dyn StateProvider>, Option<StateProviderId>)> {
        provider_tree(&self.root)
    }

    fn operation(&self) -> NamespaceOperation {
        let tree = self.tree();
        match self.kind {
            NamespaceChangeKind::Added => NamespaceOperation::Add {
                entries: tree
                    .into_iter()
                    .map(|(provider, parent_id)| LoggedProvider {
                        name: provider.name().to_string(),
                        id: provider.id(),
                        type_descriptor: provider.type_descriptor().encode(),
                        parent_id,
                    })
                    .collect(),
            },
            NamespaceChangeKind::Removed => NamespaceOperation::Remove {
                ids: tree.into_iter().map(|(provider, _)| provider.id()).collect(),
            },
        }
    }
}

/// `root` followed by its children, each with its parent id
pub(crate) fn provider_tree(
    root: &Arc<dyn StateProvider>,
) -> Vec<(Arc<dyn StateProvider>, Option<StateProviderId>)> {
    let mut tree = vec![(Arc::clone(root), None)];
    for child in root.children() {
        tree.push((child, Some(root.id())));
    }
    tree
}

/// What a transaction currently sees under a name
pub(crate) enum PendingLookup {
    /// Not touched by this transaction
    Untouched,
    /// Added by this transaction
    Added(Arc<dyn StateProvider>),
    /// Removed by this transaction
    Removed,
}

/// The state manager's view of one transaction
pub struct NamespaceTransaction {
    txn: WeakTransaction,
    state_manager: Weak<StateManager>,
    changes: Mutex<Vec<PendingChange>>,
    /// Changes handed to the log, applied and published after replication
    prepared: Mutex<Vec<PendingChange>>,
}

impl NamespaceTransaction {
    pub(crate) fn new(state_manager: &Arc<StateManager>, txn: &Transaction) -> Self {
        NamespaceTransaction {
            txn: txn.downgrade(),
            state_manager: Arc::downgrade(state_manager),
            changes: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
        }
    }

    /// Id of the owning transaction
    pub fn id(&self) -> TransactionId {
        self.txn.id()
    }

    /// Number of buffered adds and removes
    pub fn pending_changes(&self) -> usize {
        self.changes.lock().len()
    }

    pub(crate) fn lookup(&self, name: &StateProviderName) -> PendingLookup {
        for change in self.changes.lock().iter().rev() {
            if change.root.name() == name {
                return match change.kind {
                    NamespaceChangeKind::Added => PendingLookup::Added(Arc::clone(&change.root)),
                    NamespaceChangeKind::Removed => PendingLookup::Removed,
                };
            }
            if change.kind == NamespaceChangeKind::Added {
                if let Some(child) = change.root.children().into_iter().find(|c| c.name() == name) {
                    return PendingLookup::Added(child);
                }
            }
        }
        PendingLookup::Untouched
    }

    pub(crate) fn buffer_add(&self, root: Arc<dyn StateProvider>) {
        trace!(txn = %self.id(), name = %root.name(), "Namespace add buffered");
        self.changes.lock().push(PendingChange {
            kind: NamespaceChangeKind::Added,
            root,
        });
    }

    /// Buffer a remove of `root`
    ///
    /// Removing a provider this transaction added cancels the add instead.
    pub(crate) fn buffer_remove(&self, root: Arc<dyn StateProvider>) {
        let mut changes = self.changes.lock();
        let pending_add = changes
            .iter()
            .rposition(|c| c.kind == NamespaceChangeKind::Added && c.root.id() == root.id());
        match pending_add {
            Some(index) => {
                let cancelled = changes.remove(index);
                drop(changes);
                retire_tree(&cancelled.root);
                trace!(txn = %self.id(), name = %cancelled.root.name(), "Namespace add cancelled");
            }
            None => {
                trace!(txn = %self.id(), name = %root.name(), "Namespace remove buffered");
                changes.push(PendingChange {
                    kind: NamespaceChangeKind::Removed,
                    root,
                });
            }
        }
    }

    fn finish(&self) {
        if let Some(state_manager) = self.state_manager.upgrade() {
            state_manager.release_transaction(self.id());
        }
    }
}

pub(crate) fn retire_tree(root: &Arc<dyn StateProvider>) {
    for (provider, _) in provider_tree(root) {
        provider.retire();
    }
}

impl TransactionParticipant for NamespaceTransaction {
    fn provider_id(&self) -> StateProviderId {
        StateProviderId::STATE_MANAGER
    }

    fn collect_operations(&self) -> StateResult<Option<Vec<u8>>> {
        let changes = self.changes.lock().clone();
        if changes.is_empty() {
            return Ok(None);
        }
        let operations: Vec<NamespaceOperation> =
            changes.iter().map(PendingChange::operation).collect();
        let payload = encode_namespace_operations(&operations)?;
        trace!(txn = %self.id(), operations = operations.len(), "Namespace operations collected");
        *self.prepared.lock() = changes;
        Ok(Some(payload))
    }

    fn apply_committed(&self, lsn: Lsn) -> StateResult<()> {
        let Some(state_manager) = self.state_manager.upgrade() else {
            return Err(StateError::ProviderClosed("state manager".to_string()));
        };
        let prepared = self.prepared.lock();
        for change in prepared.iter() {
            state_manager.apply_change(change, lsn);
        }
        Ok(())
    }

    fn unlock(&self) {
        self.changes.lock().clear();
        self.finish();
    }

    fn publish_notifications(&self, txn: &Transaction, lsn: Lsn) {
        let prepared = std::mem::take(&mut *self.prepared.lock());
        if let Some(state_manager) = self.state_manager.upgrade() {
            for change in prepared {
                state_manager.notify_change(txn, change.kind, &change.root, lsn, true);
            }
        }
    }

    fn release(&self) {
        let changes = std::mem::take(&mut *self.changes.lock());
        self.prepared.lock().clear();
        for change in changes {
            if change.kind == NamespaceChangeKind::Added {
                retire_tree(&change.root);
            }
        }
        self.finish();
    }
}

impl std::fmt::Debug for NamespaceTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceTransaction")
            .field("txn", &self.txn.id())
            .field("pending", &self.changes.lock().len())
            .finish()
    }
}
