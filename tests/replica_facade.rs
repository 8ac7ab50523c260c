//! End-to-end tests through the `replistate` facade

use parking_lot::Mutex;
use replistate::{
    downcast_store, store_descriptor, CancellationToken, ChangeKind, Lsn, NamespaceChange,
    NamespaceEnumerator, Replica, ReplicaConfig, ReplicaRole, StateError, StateManagerChangeHandler,
    StateProviderName, Store, StoreChange, StoreChangeHandler,
};
use replistate::layers::storage::StoreEnumerator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const T: Duration = Duration::from_secs(5);
const META: &str = "u64:String";
const ACCOUNTS: &str = "fabric:/accounts";

fn none() -> CancellationToken {
    CancellationToken::none()
}

#[derive(Default)]
struct Recorder {
    changes: Mutex<Vec<(ChangeKind, u64, Option<String>, Lsn)>>,
    rebuilt: Mutex<Option<Vec<(u64, String)>>>,
}

impl StoreChangeHandler<u64, String> for Recorder {
    fn on_change(&self, change: StoreChange<u64, String>) {
        self.changes
            .lock()
            .push((change.kind, change.key, change.value, change.lsn));
    }

    fn on_rebuilt(&self, contents: StoreEnumerator<u64, String>) {
        *self.rebuilt.lock() = Some(contents.map(|(k, vv)| (k, vv.value)).collect());
    }
}

/// Attaches a `Recorder` to every store the namespace rebuild hands out
struct Attach {
    recorder: Arc<Recorder>,
}

impl StateManagerChangeHandler for Attach {
    fn on_change(&self, _change: NamespaceChange) {}

    fn on_rebuilt(&self, providers: NamespaceEnumerator) {
        for (_, provider) in providers {
            if let Ok(store) = downcast_store::<u64, String>(provider) {
                store.set_change_handler(self.recorder.clone(), None);
            }
        }
    }
}

async fn open(dir: &Path, attach: Option<Arc<Recorder>>) -> Arc<Replica> {
    let mut builder = Replica::builder()
        .path(dir)
        .config(ReplicaConfig {
            checkpoint_threshold: 0,
            ..ReplicaConfig::default()
        })
        .register_store::<u64, String>(META);
    if let Some(recorder) = attach {
        builder = builder.change_handler(Arc::new(Attach { recorder }));
    }
    let replica = builder.open().await.unwrap();
    replica.change_role(ReplicaRole::Primary).await.unwrap();
    replica
}

async fn accounts(replica: &Replica) -> Arc<Store<u64, String>> {
    let txn = replica.create_transaction().unwrap();
    let (provider, _) = replica
        .state_manager()
        .get_or_add(
            &txn,
            StateProviderName::new(ACCOUNTS).unwrap(),
            store_descriptor(META),
            T,
            &none(),
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();
    downcast_store::<u64, String>(provider).unwrap()
}

#[tokio::test]
async fn test_store_changes_are_published_in_commit_order() {
    let dir = TempDir::new().unwrap();
    let replica = open(dir.path(), None).await;
    let store = accounts(&replica).await;
    let recorder = Arc::new(Recorder::default());
    store.set_change_handler(recorder.clone(), None);

    let txn = replica.create_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    store.add(&stxn, 1, "alice".into(), T, &none()).await.unwrap();
    store.add(&stxn, 2, "bob".into(), T, &none()).await.unwrap();
    let first = txn.commit().await.unwrap();

    let txn = replica.create_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    assert!(store
        .conditional_update(&stxn, 1, "alice v2".into(), T, &none(), Some(first))
        .await
        .unwrap());
    assert!(store
        .conditional_remove(&stxn, 2, T, &none(), None)
        .await
        .unwrap());
    let second = txn.commit().await.unwrap();

    let changes = recorder.changes.lock().clone();
    assert_eq!(
        changes,
        vec![
            (ChangeKind::Add, 1, Some("alice".to_string()), first),
            (ChangeKind::Add, 2, Some("bob".to_string()), first),
            (ChangeKind::Update, 1, Some("alice v2".to_string()), second),
            (ChangeKind::Remove, 2, None, second),
        ]
    );
    assert_eq!(store.count(), 1);
}

#[tokio::test]
async fn test_stale_version_leaves_value_untouched() {
    let dir = TempDir::new().unwrap();
    let replica = open(dir.path(), None).await;
    let store = accounts(&replica).await;

    let txn = replica.create_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    store.add(&stxn, 7, "seven".into(), T, &none()).await.unwrap();
    let created = txn.commit().await.unwrap();

    let txn = replica.create_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    store
        .conditional_update(&stxn, 7, "eight".into(), T, &none(), None)
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let txn = replica.create_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    let updated = store
        .conditional_update(&stxn, 7, "nine".into(), T, &none(), Some(created))
        .await
        .unwrap();
    assert!(!updated);
    let err = store
        .add(&stxn, 7, "again".into(), T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::KeyAlreadyExists));
    txn.abort();

    let read = replica.create_read_only_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&read).unwrap();
    let current = store.conditional_get(&stxn, &7, T, &none()).await.unwrap();
    assert_eq!(current.map(|vv| vv.value), Some("eight".to_string()));
}

#[tokio::test]
async fn test_rebuilt_stores_can_be_subscribed_during_namespace_rebuild() {
    let dir = TempDir::new().unwrap();
    {
        let replica = open(dir.path(), None).await;
        let store = accounts(&replica).await;
        let txn = replica.create_transaction().unwrap();
        let stxn = store.create_or_find_transaction(&txn).unwrap();
        store.add(&stxn, 2, "bob".into(), T, &none()).await.unwrap();
        store.add(&stxn, 1, "alice".into(), T, &none()).await.unwrap();
        txn.commit().await.unwrap();
        replica.checkpoint().await.unwrap();
        replica.close().await.unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    let replica = open(dir.path(), Some(recorder.clone())).await;
    assert_eq!(
        recorder.rebuilt.lock().clone(),
        Some(vec![(1, "alice".to_string()), (2, "bob".to_string())])
    );

    let store = accounts(&replica).await;
    let txn = replica.create_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    store.add(&stxn, 3, "carol".into(), T, &none()).await.unwrap();
    let lsn = txn.commit().await.unwrap();
    assert_eq!(
        recorder.changes.lock().last().cloned(),
        Some((ChangeKind::Add, 3, Some("carol".to_string()), lsn))
    );
}
