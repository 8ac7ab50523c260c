//! State manager change notifications
//!
//! `Added` and `Removed` fire once per committed namespace change, after the
//! commit is durable and in commit order. `Rebuilt` fires once after
//! recovery, restore or data loss with an enumerator over the whole
//! namespace; the replica waits until that enumerator is drained (or
//! completed, or dropped) before it reports recovery as finished.

use replistate_concurrency::{StateProvider, Transaction};
use replistate_core::{Lsn, StateProviderName};
use std::sync::Arc;
use tokio::sync::oneshot;

/// What happened to a name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceChangeKind {
    /// The name was registered
    Added,
    /// The name was removed
    Removed,
}

/// One committed namespace change
#[derive(Clone)]
pub struct NamespaceChange {
    /// Committing transaction
    pub transaction: Transaction,
    /// Added or removed
    pub kind: NamespaceChangeKind,
    /// Affected name
    pub name: StateProviderName,
    /// Provider registered (or unregistered) under `name`
    pub provider: Arc<dyn StateProvider>,
    /// Commit LSN
    pub lsn: Lsn,
    /// Whether the change was committed on this replica as primary
    pub is_primary: bool,
}

impl std::fmt::Debug for NamespaceChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceChange")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("lsn", &self.lsn)
            .field("is_primary", &self.is_primary)
            .finish()
    }
}

/// Lazy, non-restartable sequence over the rebuilt namespace
///
/// Rebuild completion is signalled when the sequence reaches its end, when
/// [`complete`](Self::complete) is called, or when it is dropped.
pub struct NamespaceEnumerator {
    entries: std::vec::IntoIter<(StateProviderName, Arc<dyn StateProvider>)>,
    done: Option<oneshot::Sender<()>>,
}

impl NamespaceEnumerator {
    pub(crate) fn new(
        entries: Vec<(StateProviderName, Arc<dyn StateProvider>)>,
        done: Option<oneshot::Sender<()>>,
    ) -> Self {
        NamespaceEnumerator {
            entries: entries.into_iter(),
            done,
        }
    }

    /// Entries not yet yielded
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    /// Signal rebuild completion without draining
    pub fn complete(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Iterator for NamespaceEnumerator {
    type Item = (StateProviderName, Arc<dyn StateProvider>);

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.entries.next();
        if next.is_none() {
            self.complete();
        }
        next
    }
}

impl Drop for NamespaceEnumerator {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Handler for namespace changes
pub trait StateManagerChangeHandler: Send + Sync {
    /// A name was added or removed by a committed transaction
    fn on_change(&self, change: NamespaceChange);

    /// The namespace was re-materialized; `providers` yields every entry
    fn on_rebuilt(&self, providers: NamespaceEnumerator);
}
