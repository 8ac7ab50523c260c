//! Integration tests for the replica
//!
//! These tests open real replicas in temporary directories and verify:
//! - Recovery from checkpoint + log after reopen
//! - Checkpoints and log truncation
//! - Full and incremental backups, chain validation, restore
//! - Safe / Force restore policies and the primary guard
//! - Data loss handling and rebuild completeness
//! - Secondary apply and automatic checkpoints

use async_trait::async_trait;
use parking_lot::Mutex;
use replistate_concurrency::{Transaction, TransactionChangeHandler};
use replistate_core::{
    CancellationToken, Lsn, ReplicaRole, StateError, StateProviderName, StateResult,
    VersionedValue,
};
use replistate_durability::{BackupInfo, BackupOption, LogRecord};
use replistate_engine::{
    downcast_store, store_descriptor, BackupUploader, DataLossHandler, FolderUploader,
    NamespaceChange, NamespaceChangeKind, NamespaceEnumerator, Replica, ReplicaConfig,
    RestoreContext, RestorePolicy, StateManagerChangeHandler,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Helper Functions
// ============================================================================

const T: Duration = Duration::from_secs(5);
const META: &str = "String:String";
const ORDERS: &str = "fabric:/orders";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn none() -> CancellationToken {
    CancellationToken::none()
}

fn name(s: &str) -> StateProviderName {
    StateProviderName::new(s).unwrap()
}

fn quiet_config() -> ReplicaConfig {
    ReplicaConfig {
        checkpoint_threshold: 0,
        ..ReplicaConfig::default()
    }
}

#[derive(Default)]
struct Namespace {
    rebuilt: Mutex<Vec<Vec<String>>>,
    changes: Mutex<Vec<(NamespaceChangeKind, String, bool)>>,
}

impl Namespace {
    fn last_rebuilt(&self) -> Vec<String> {
        self.rebuilt.lock().last().cloned().unwrap_or_default()
    }
}

impl StateManagerChangeHandler for Namespace {
    fn on_change(&self, change: NamespaceChange) {
        self.changes
            .lock()
            .push((change.kind, change.name.to_string(), change.is_primary));
    }

    fn on_rebuilt(&self, providers: NamespaceEnumerator) {
        let names = providers.map(|(name, _)| name.to_string()).collect();
        self.rebuilt.lock().push(names);
    }
}

async fn open_with(
    dir: &Path,
    config: ReplicaConfig,
    namespace: Option<Arc<Namespace>>,
    data_loss: Option<Arc<dyn DataLossHandler>>,
) -> Arc<Replica> {
    let mut builder = Replica::builder()
        .path(dir)
        .config(config)
        .register_store::<String, String>(META);
    if let Some(namespace) = namespace {
        builder = builder.change_handler(namespace);
    }
    if let Some(handler) = data_loss {
        builder = builder.data_loss_handler(handler);
    }
    builder.open().await.unwrap()
}

async fn open_primary(dir: &Path) -> Arc<Replica> {
    let replica = open_with(dir, quiet_config(), None, None).await;
    replica.change_role(ReplicaRole::Primary).await.unwrap();
    replica
}

/// Insert or overwrite `key` in `store_name`, creating the store on first use
async fn put(replica: &Replica, store_name: &str, key: &str, value: &str) -> Lsn {
    let txn = replica.create_transaction().unwrap();
    let (provider, _) = replica
        .state_manager()
        .get_or_add(&txn, name(store_name), store_descriptor(META), T, &none())
        .await
        .unwrap();
    let store = downcast_store::<String, String>(provider).unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    let existing = store
        .conditional_get(&stxn, &key.to_string(), T, &none())
        .await
        .unwrap();
    if existing.is_some() {
        let updated = store
            .conditional_update(&stxn, key.to_string(), value.to_string(), T, &none(), None)
            .await
            .unwrap();
        assert!(updated);
    } else {
        store
            .add(&stxn, key.to_string(), value.to_string(), T, &none())
            .await
            .unwrap();
    }
    txn.commit().await.unwrap()
}

async fn get(replica: &Replica, store_name: &str, key: &str) -> Option<VersionedValue<String>> {
    let store = replica
        .state_manager()
        .get_store::<String, String>(&name(store_name))
        .unwrap();
    let txn = replica.create_read_only_transaction().unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    let found = store
        .conditional_get(&stxn, &key.to_string(), T, &none())
        .await
        .unwrap();
    txn.abort();
    found
}

fn contents(replica: &Replica, store_name: &str) -> Vec<(String, Lsn, String)> {
    let store = replica
        .state_manager()
        .get_store::<String, String>(&name(store_name))
        .unwrap();
    store
        .snapshot_enumerator()
        .unwrap()
        .map(|(key, vv)| (key, vv.version, vv.value))
        .collect()
}

fn backup_dirs(folder: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(folder) {
        Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => Vec::new(),
    }
}

struct RejectingUploader;

#[async_trait]
impl BackupUploader for RejectingUploader {
    async fn upload(&self, _info: &BackupInfo) -> StateResult<bool> {
        Ok(false)
    }
}

struct RestoreFrom {
    folder: PathBuf,
}

#[async_trait]
impl DataLossHandler for RestoreFrom {
    async fn on_data_loss(&self, ctx: RestoreContext) -> StateResult<bool> {
        ctx.restore(&self.folder, RestorePolicy::Force, T, &CancellationToken::none())
            .await?;
        Ok(true)
    }
}

struct AcceptCurrent;

#[async_trait]
impl DataLossHandler for AcceptCurrent {
    async fn on_data_loss(&self, _ctx: RestoreContext) -> StateResult<bool> {
        Ok(false)
    }
}

#[derive(Default)]
struct CommitCounter(AtomicUsize);

impl TransactionChangeHandler for CommitCounter {
    fn on_committed(&self, _txn: &Transaction, _lsn: Lsn) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_reopen_recovers_namespace_and_versions() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    put(&replica, ORDERS, "b", "2").await;
    let updated_at = put(&replica, ORDERS, "a", "3").await;
    let before = contents(&replica, ORDERS);
    replica.close().await.unwrap();
    drop(replica);

    let namespace = Arc::new(Namespace::default());
    let reopened = open_with(dir.path(), quiet_config(), Some(namespace.clone()), None).await;
    assert_eq!(reopened.last_committed_lsn(), updated_at);
    assert_eq!(contents(&reopened, ORDERS), before);
    assert_eq!(namespace.last_rebuilt(), vec![ORDERS.to_string()]);

    let a = get(&reopened, ORDERS, "a").await.unwrap();
    assert_eq!(a.value, "3");
    assert_eq!(a.version, updated_at);
}

#[tokio::test]
async fn test_lsns_continue_after_reopen() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    let first = put(&replica, ORDERS, "a", "1").await;
    replica.close().await.unwrap();
    drop(replica);

    let reopened = open_primary(dir.path()).await;
    let second = put(&reopened, ORDERS, "b", "2").await;
    assert_eq!(second, first.next());
}

#[tokio::test]
async fn test_removed_store_stays_removed_after_reopen() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    put(&replica, "fabric:/audit", "x", "y").await;

    let txn = replica.create_transaction().unwrap();
    replica
        .state_manager()
        .remove(&txn, name("fabric:/audit"), T, &none())
        .await
        .unwrap();
    txn.commit().await.unwrap();
    replica.close().await.unwrap();
    drop(replica);

    let reopened = open_primary(dir.path()).await;
    assert!(reopened.state_manager().contains(&name(ORDERS)));
    assert!(!reopened.state_manager().contains(&name("fabric:/audit")));
}

#[tokio::test]
async fn test_closed_replica_refuses_work() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    replica.close().await.unwrap();
    replica.close().await.unwrap();
    assert!(replica.is_closed());
    assert!(matches!(
        replica.create_transaction(),
        Err(StateError::ProviderClosed(_))
    ));
}

// ============================================================================
// Checkpoint
// ============================================================================

#[tokio::test]
async fn test_checkpoint_truncates_log_and_recovers() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    put(&replica, ORDERS, "b", "2").await;

    let checkpoint_lsn = replica.checkpoint().await.unwrap();
    assert_eq!(checkpoint_lsn, replica.last_committed_lsn());
    assert_eq!(replica.checkpoints().last_checkpoint_lsn(), checkpoint_lsn);
    let log = replica.replicator().log();
    assert_eq!(log.truncated_through(), checkpoint_lsn);
    assert!(log
        .read_all()
        .unwrap()
        .iter()
        .all(|r| !r.is_transaction() || r.lsn() > checkpoint_lsn));

    put(&replica, ORDERS, "c", "3").await;
    let before = contents(&replica, ORDERS);
    replica.close().await.unwrap();
    drop(replica);

    let reopened = open_primary(dir.path()).await;
    assert_eq!(contents(&reopened, ORDERS), before);
    assert_eq!(reopened.checkpoints().last_checkpoint_lsn(), checkpoint_lsn);
}

#[tokio::test]
async fn test_checkpoint_drops_files_of_removed_stores() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    put(&replica, "fabric:/audit", "x", "y").await;
    replica.checkpoint().await.unwrap();
    let audit_id = replica
        .state_manager()
        .get(&name("fabric:/audit"))
        .unwrap()
        .id();
    let layout = replica.checkpoints().layout().clone();
    assert!(layout.provider(audit_id).exists());

    let txn = replica.create_transaction().unwrap();
    replica
        .state_manager()
        .remove(&txn, name("fabric:/audit"), T, &none())
        .await
        .unwrap();
    txn.commit().await.unwrap();
    replica.checkpoint().await.unwrap();
    assert!(!layout.provider(audit_id).exists());
}

#[tokio::test]
async fn test_interrupted_checkpoint_leftovers_are_ignored() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    replica.checkpoint().await.unwrap();
    let staged = replica.checkpoints().layout().metadata_staged();
    replica.close().await.unwrap();
    drop(replica);

    std::fs::write(&staged, b"half written").unwrap();
    let reopened = open_primary(dir.path()).await;
    assert!(!staged.exists());
    assert_eq!(get(&reopened, ORDERS, "a").await.unwrap().value, "1");
}

#[tokio::test]
async fn test_automatic_checkpoint_after_threshold() {
    let dir = TempDir::new().unwrap();
    let config = ReplicaConfig {
        checkpoint_threshold: 3,
        ..ReplicaConfig::default()
    };
    let replica = open_with(dir.path(), config, None, None).await;
    replica.change_role(ReplicaRole::Primary).await.unwrap();
    for i in 0..5 {
        put(&replica, ORDERS, &format!("k{}", i), "v").await;
    }

    let mut waited = Duration::ZERO;
    while replica.checkpoints().last_checkpoint_lsn() < Lsn::new(3) && waited < T {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert!(replica.checkpoints().last_checkpoint_lsn() >= Lsn::new(3));
}

// ============================================================================
// Backup
// ============================================================================

#[tokio::test]
async fn test_incremental_without_prior_backup_fails() {
    let dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;

    let err = replica
        .backup(&FolderUploader::new(dest.path()), BackupOption::Incremental, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidBackupChain(_)));
}

#[tokio::test]
async fn test_rejected_upload_fails_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;

    let err = replica
        .backup(&RejectingUploader, BackupOption::Full, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidOperation(_)));
    assert!(backup_dirs(replica.backups().work_dir()).is_empty());
    assert!(replica.backups().last_backup().is_none());
}

#[tokio::test]
async fn test_full_backup_layout() {
    let dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    let last = put(&replica, ORDERS, "b", "2").await;

    let info = replica
        .backup(&FolderUploader::new(dest.path()), BackupOption::Full, T, &none())
        .await
        .unwrap();
    assert_eq!(info.option(), BackupOption::Full);
    assert_eq!(info.end_lsn(), last);
    assert_eq!(replica.backups().last_backup(), Some((info.backup_id(), last)));
    assert!(!info.directory.exists(), "local folder is removed after upload");

    let uploaded = dest.path().join(info.backup_id().to_string());
    assert!(uploaded.join("backup.metadata").exists());
    assert!(uploaded.join("sm").join("sm.chk").exists());
    assert!(uploaded.join("lr").join("log.bin").exists());

    let markers: Vec<LogRecord> = replica
        .replicator()
        .log()
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|r| matches!(r, LogRecord::Backup { .. }))
        .collect();
    assert_eq!(markers.len(), 1);
}

#[tokio::test]
async fn test_empty_incremental_is_rejected() {
    let dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    let uploader = FolderUploader::new(dest.path());
    replica
        .backup(&uploader, BackupOption::Full, T, &none())
        .await
        .unwrap();

    let err = replica
        .backup(&uploader, BackupOption::Incremental, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_incremental_over_record_limit_fails() {
    let dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let config = ReplicaConfig {
        max_incremental_backup_records: 1,
        ..quiet_config()
    };
    let replica = open_with(dir.path(), config, None, None).await;
    replica.change_role(ReplicaRole::Primary).await.unwrap();
    put(&replica, ORDERS, "a", "1").await;
    let uploader = FolderUploader::new(dest.path());
    replica
        .backup(&uploader, BackupOption::Full, T, &none())
        .await
        .unwrap();
    put(&replica, ORDERS, "b", "2").await;
    put(&replica, ORDERS, "c", "3").await;

    let err = replica
        .backup(&uploader, BackupOption::Incremental, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_checkpoint_keeps_log_since_last_backup() {
    let dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    put(&replica, ORDERS, "a", "1").await;
    let info = replica
        .backup(&FolderUploader::new(dest.path()), BackupOption::Full, T, &none())
        .await
        .unwrap();
    put(&replica, ORDERS, "b", "2").await;
    put(&replica, ORDERS, "c", "3").await;

    replica.checkpoint().await.unwrap();
    let log = replica.replicator().log();
    assert_eq!(log.truncated_through(), info.end_lsn());
    assert_eq!(log.read_transactions_after(info.end_lsn()).unwrap().len(), 2);
}

// ============================================================================
// Restore
// ============================================================================

/// Source replica with a full backup and one incremental in `dest`
async fn backed_up_source(dir: &Path, dest: &Path) -> (Arc<Replica>, Vec<BackupInfo>) {
    let source = open_primary(dir).await;
    put(&source, ORDERS, "a", "1").await;
    put(&source, ORDERS, "b", "2").await;
    let uploader = FolderUploader::new(dest);
    let full = source
        .backup(&uploader, BackupOption::Full, T, &none())
        .await
        .unwrap();
    put(&source, ORDERS, "c", "3").await;
    put(&source, ORDERS, "a", "4").await;
    let incremental = source
        .backup(&uploader, BackupOption::Incremental, T, &none())
        .await
        .unwrap();
    assert_eq!(incremental.metadata.parent_backup_id, Some(full.backup_id()));
    assert_eq!(incremental.metadata.start_lsn, full.end_lsn().next());
    (source, vec![full, incremental])
}

#[tokio::test]
async fn test_restore_chain_reproduces_keys_and_versions() {
    init_tracing();
    let source_dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let (source, _) = backed_up_source(source_dir.path(), dest.path()).await;
    let expected = contents(&source, ORDERS);

    let target_dir = TempDir::new().unwrap();
    let namespace = Arc::new(Namespace::default());
    let target = open_with(target_dir.path(), quiet_config(), Some(namespace.clone()), None).await;
    assert!(namespace.last_rebuilt().is_empty());

    target
        .restore(dest.path(), RestorePolicy::Safe, T, &none())
        .await
        .unwrap();
    assert_eq!(contents(&target, ORDERS), expected);
    assert_eq!(target.last_committed_lsn(), source.last_committed_lsn());
    assert_eq!(namespace.last_rebuilt(), vec![ORDERS.to_string()]);

    target.close().await.unwrap();
    drop(target);
    let reopened = open_primary(target_dir.path()).await;
    assert_eq!(contents(&reopened, ORDERS), expected);
    let next = put(&reopened, ORDERS, "d", "5").await;
    assert_eq!(next, source.last_committed_lsn().next());
}

#[tokio::test]
async fn test_restore_with_missing_link_fails() {
    let source_dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let (source, mut backups) = backed_up_source(source_dir.path(), dest.path()).await;
    put(&source, ORDERS, "e", "6").await;
    let uploader = FolderUploader::new(dest.path());
    backups.push(
        source
            .backup(&uploader, BackupOption::Incremental, T, &none())
            .await
            .unwrap(),
    );
    std::fs::remove_dir_all(dest.path().join(backups[1].backup_id().to_string())).unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = open_with(target_dir.path(), quiet_config(), None, None).await;
    let err = target
        .restore(dest.path(), RestorePolicy::Force, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidBackupChain(_)));
    assert!(target.state_manager().is_empty());
}

#[tokio::test]
async fn test_restore_from_missing_folder_fails() {
    let target_dir = TempDir::new().unwrap();
    let target = open_with(target_dir.path(), quiet_config(), None, None).await;
    let err = target
        .restore(&target_dir.path().join("nowhere"), RestorePolicy::Force, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::RestoreFailed(_)));
}

#[tokio::test]
async fn test_safe_restore_refuses_state_that_is_not_behind() {
    let source_dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let (source, _) = backed_up_source(source_dir.path(), dest.path()).await;
    source
        .change_role(ReplicaRole::ActiveSecondary)
        .await
        .unwrap();

    let err = source
        .restore(dest.path(), RestorePolicy::Safe, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::RestoreFailed(_)));

    let expected = contents(&source, ORDERS);
    source
        .restore(dest.path(), RestorePolicy::Force, T, &none())
        .await
        .unwrap();
    assert_eq!(contents(&source, ORDERS), expected);
}

#[tokio::test]
async fn test_restore_on_primary_is_refused() {
    let source_dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let (source, _) = backed_up_source(source_dir.path(), dest.path()).await;
    let err = source
        .restore(dest.path(), RestorePolicy::Force, T, &none())
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_cancelled_restore_leaves_state_alone() {
    let source_dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let (_source, _) = backed_up_source(source_dir.path(), dest.path()).await;

    let target_dir = TempDir::new().unwrap();
    let target = open_with(target_dir.path(), quiet_config(), None, None).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = target
        .restore(dest.path(), RestorePolicy::Force, T, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::OperationCanceled));
    assert!(target.state_manager().is_empty());
}

// ============================================================================
// Data loss
// ============================================================================

#[tokio::test]
async fn test_data_loss_restore_rebuilds_exactly_the_backup_namespace() {
    let source_dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let (source, _) = backed_up_source(source_dir.path(), dest.path()).await;
    let expected = contents(&source, ORDERS);

    let dir = TempDir::new().unwrap();
    let namespace = Arc::new(Namespace::default());
    let handler: Arc<dyn DataLossHandler> = Arc::new(RestoreFrom {
        folder: dest.path().to_path_buf(),
    });
    let replica = open_with(dir.path(), quiet_config(), Some(namespace.clone()), Some(handler)).await;
    replica.change_role(ReplicaRole::Primary).await.unwrap();
    put(&replica, "fabric:/scratch", "x", "y").await;

    assert!(replica.on_data_loss().await.unwrap());
    assert_eq!(namespace.last_rebuilt(), vec![ORDERS.to_string()]);
    assert!(!replica.state_manager().contains(&name("fabric:/scratch")));
    assert_eq!(contents(&replica, ORDERS), expected);

    // Still primary and writable after the restore.
    put(&replica, ORDERS, "z", "26").await;
}

#[tokio::test]
async fn test_data_loss_without_change_keeps_state() {
    let dir = TempDir::new().unwrap();
    let namespace = Arc::new(Namespace::default());
    let replica = open_with(
        dir.path(),
        quiet_config(),
        Some(namespace.clone()),
        Some(Arc::new(AcceptCurrent)),
    )
    .await;
    replica.change_role(ReplicaRole::Primary).await.unwrap();
    put(&replica, ORDERS, "a", "1").await;
    let rebuilds = namespace.rebuilt.lock().len();

    assert!(!replica.on_data_loss().await.unwrap());
    assert_eq!(namespace.rebuilt.lock().len(), rebuilds);
    assert_eq!(get(&replica, ORDERS, "a").await.unwrap().value, "1");
}

#[tokio::test]
async fn test_data_loss_without_handler_reports_no_change() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    assert!(!replica.on_data_loss().await.unwrap());
}

// ============================================================================
// Secondary apply
// ============================================================================

#[tokio::test]
async fn test_secondary_applies_primary_log() {
    let primary_dir = TempDir::new().unwrap();
    let primary = open_primary(primary_dir.path()).await;
    put(&primary, ORDERS, "a", "1").await;
    put(&primary, ORDERS, "b", "2").await;
    put(&primary, ORDERS, "a", "3").await;
    let records: Vec<LogRecord> = primary
        .replicator()
        .log()
        .read_all()
        .unwrap()
        .into_iter()
        .filter(LogRecord::is_transaction)
        .collect();

    let secondary_dir = TempDir::new().unwrap();
    let namespace = Arc::new(Namespace::default());
    let secondary = open_with(secondary_dir.path(), quiet_config(), Some(namespace.clone()), None).await;
    secondary
        .change_role(ReplicaRole::ActiveSecondary)
        .await
        .unwrap();
    let commits = Arc::new(CommitCounter::default());
    secondary.manager().set_commit_handler(commits.clone(), None);

    for record in &records {
        secondary.apply_replicated(record).await.unwrap();
    }

    assert_eq!(secondary.last_committed_lsn(), primary.last_committed_lsn());
    assert_eq!(contents(&secondary, ORDERS), contents(&primary, ORDERS));
    assert_eq!(commits.0.load(Ordering::SeqCst), records.len());
    assert_eq!(
        *namespace.changes.lock(),
        vec![(NamespaceChangeKind::Added, ORDERS.to_string(), false)]
    );

    let err = secondary.apply_replicated(&records[0]).await.unwrap_err();
    assert!(matches!(err, StateError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_primary_refuses_replicated_records() {
    let dir = TempDir::new().unwrap();
    let primary = open_primary(dir.path()).await;
    put(&primary, ORDERS, "a", "1").await;
    let record = primary
        .replicator()
        .log()
        .read_all()
        .unwrap()
        .into_iter()
        .find(LogRecord::is_transaction)
        .unwrap();
    let err = primary.apply_replicated(&record).await.unwrap_err();
    assert!(matches!(err, StateError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_secondary_cannot_commit() {
    let dir = TempDir::new().unwrap();
    let replica = open_with(dir.path(), quiet_config(), None, None).await;
    replica
        .change_role(ReplicaRole::ActiveSecondary)
        .await
        .unwrap();
    let txn = replica.create_transaction().unwrap();
    let (provider, _) = replica
        .state_manager()
        .get_or_add(&txn, name(ORDERS), store_descriptor(META), T, &none())
        .await
        .unwrap();
    let store = downcast_store::<String, String>(provider).unwrap();
    let stxn = store.create_or_find_transaction(&txn).unwrap();
    store
        .add(&stxn, "a".to_string(), "1".to_string(), T, &none())
        .await
        .unwrap();
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, StateError::NotPrimary));
    assert!(!replica.state_manager().contains(&name(ORDERS)));
}

// ============================================================================
// Epochs
// ============================================================================

#[tokio::test]
async fn test_epoch_survives_reopen_and_only_moves_forward() {
    let dir = TempDir::new().unwrap();
    let replica = open_primary(dir.path()).await;
    let epoch = replica.epoch().next_configuration();
    replica.update_epoch(epoch).unwrap();
    put(&replica, ORDERS, "a", "1").await;
    assert!(replica.update_epoch(Default::default()).is_err());
    replica.close().await.unwrap();
    drop(replica);

    let reopened = open_primary(dir.path()).await;
    assert_eq!(reopened.epoch(), epoch);
}
