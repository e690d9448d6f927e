//! Unit tests for store backups and restore

use std::sync::Arc;

use fleet_operator::crd::{FleetCluster, FleetWorkspace, LifecycleState};
use fleet_operator::store::{
    Backup, BackupError, BlobStore, FsBlobStore, MemoryBackend, MemoryBlobStore, VersionedStore,
    restore_into, restore_latest,
};

use crate::common::*;

async fn backed_up_store(
    objects: Vec<FleetWorkspace>,
    blobs: Arc<dyn BlobStore>,
) -> Arc<VersionedStore<FleetWorkspace>> {
    VersionedStore::start_with_backup(Arc::new(MemoryBackend::with_objects(objects)), Some(blobs))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_backup_without_blob_store() {
    let store = memory_store::<FleetCluster>(vec![]).await;
    assert!(matches!(
        store.backup().await,
        Err(BackupError::NotConfigured(_))
    ));
}

#[tokio::test]
async fn test_backup_writes_new_blob_each_time() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let store = backed_up_store(vec![workspace("ws1", "c1")], blobs.clone()).await;

    let first = store.backup().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store.backup().await.unwrap();

    assert_ne!(first, second);
    assert!(first.starts_with("backups/fleetworkspace/"));
    let keys = blobs.list("backups/fleetworkspace/").await.unwrap();
    assert_eq!(keys.len(), 2);
}

#[tokio::test]
async fn test_restore_recreates_objects_with_status() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let source = backed_up_store(
        vec![
            workspace_in("ws1", "c1", LifecycleState::Ready),
            workspace_in("ws2", "c1", LifecycleState::Failed),
        ],
        blobs.clone(),
    )
    .await;
    source.backup().await.unwrap();

    let record = restore_latest(blobs.as_ref(), "FleetWorkspace")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.items.len(), 2);

    // The target already holds ws1; only ws2 is restored
    let target = memory_store(vec![workspace("ws1", "c2")]).await;
    let restored = restore_into(&target, &record).await.unwrap();
    assert_eq!(restored, 1);

    assert_eq!(target.get("ws1").await.unwrap().spec.cluster_name, "c2");
    let ws2 = target.get("ws2").await.unwrap();
    assert_eq!(ws2.spec.cluster_name, "c1");
    assert_eq!(ws2.status.unwrap().state, LifecycleState::Failed);
}

#[tokio::test]
async fn test_backup_to_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));
    let store = backed_up_store(vec![workspace("ws1", "c1")], blobs.clone()).await;

    let key = store.backup().await.unwrap();
    assert!(dir.path().join(&key).exists());

    let record = restore_latest(blobs.as_ref(), "FleetWorkspace")
        .await
        .unwrap()
        .unwrap();
    let objects = record.objects::<FleetWorkspace>().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].spec.cluster_name, "c1");
}
