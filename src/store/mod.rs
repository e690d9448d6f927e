//! Versioned, watch-backed object store
//!
//! A [`VersionedStore`] wraps an [`ObjectBackend`] (the Kubernetes API server in
//! production, [`MemoryBackend`] for local runs and tests) and serves reads from
//! an in-memory cache. The cache is owned by a single ingest task that applies
//! two inputs in order:
//!
//! - events from the backend's change stream
//! - acknowledgements of writes made through this store
//!
//! A write returns only after its acknowledgement has been applied, so a caller
//! always reads its own writes. Events older than the cached revision of an
//! object (or than its deletion tombstone) are dropped.

mod backup;
mod cache;
mod kube;
mod memory;

pub use self::backup::{
    BACKUP_PREFIX, Backup, BackupError, BackupPolicy, BackupRecord, BlobStore, Clock,
    FsBlobStore, MemoryBlobStore, TokioClock, backup_key, restore_into, restore_latest,
    run_periodic_backup,
};
pub use self::kube::KubeBackend;
pub use self::memory::MemoryBackend;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use ::kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use self::cache::{CacheState, CacheUpdate};

/// Delay before a broken change stream is re-established
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the change notification channel handed out by [`VersionedStore::subscribe`]
const CHANGE_BUFFER: usize = 1024;

/// Anything the store can hold: a Kubernetes-style object with static type
/// information that round-trips through serde.
pub trait StoredObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
}

impl<T> StoredObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static
{
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache for {0} is no longer running")]
    CacheClosed(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub(crate) fn not_found(kind: &str, name: &str) -> Self {
        StoreError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: &str, name: &str) -> Self {
        StoreError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn conflict(kind: &str, name: &str) -> Self {
        StoreError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// A change observed on a backend
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// A full listing is about to be taken. Local writes applied between this
    /// and the following `Restarted` may be missing from its snapshot.
    Relisting,
    /// The stream was (re)started; the payload is the full current state
    Restarted(Vec<K>),
}

/// Result of a delete request
#[derive(Clone, Debug)]
pub enum DeleteOutcome<K> {
    /// The object has finalizers and is now terminating
    Terminating(K),
    /// The object is gone; the final copy is returned when the backend has one
    Removed(Option<K>),
}

/// Storage and change feed for one kind of object
#[async_trait]
pub trait ObjectBackend<K: StoredObject>: Send + Sync {
    async fn list(&self) -> Result<Vec<K>>;

    async fn get(&self, name: &str) -> Result<K>;

    /// Create a new object. Any status on `obj` is ignored.
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace spec and metadata, keeping the stored status
    async fn replace(&self, name: &str, obj: &K) -> Result<K>;

    /// Replace status only, keeping the stored spec and metadata
    async fn replace_status(&self, name: &str, obj: &K) -> Result<K>;

    async fn delete(&self, name: &str) -> Result<DeleteOutcome<K>>;

    /// Change stream. Ends (or yields an error) when the backend connection
    /// breaks; the store then re-establishes it.
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// Notification sent to subscribers after the cache applied a change
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectChange {
    pub name: String,
    pub deleted: bool,
    pub owners: Vec<OwnerReference>,
}

impl ObjectChange {
    pub(crate) fn applied<K: StoredObject>(obj: &K) -> Self {
        Self {
            name: obj.name_any(),
            deleted: false,
            owners: obj.owner_references().to_vec(),
        }
    }

    pub(crate) fn removed<K: StoredObject>(obj: &K) -> Self {
        Self {
            name: obj.name_any(),
            deleted: true,
            owners: obj.owner_references().to_vec(),
        }
    }

    /// Name of the owner with the given kind, if any
    pub fn owner_of_kind(&self, kind: &str) -> Option<&str> {
        self.owners
            .iter()
            .find(|owner| owner.kind == kind)
            .map(|owner| owner.name.as_str())
    }
}

/// Parse the backend revision of an object
pub(crate) fn revision_of<K: StoredObject>(obj: &K) -> Option<u64> {
    obj.meta()
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
}

/// A terminating object whose last finalizer was removed no longer exists
fn is_released<K: StoredObject>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some() && obj.finalizers().is_empty()
}

/// Cached, versioned view of one kind of object
pub struct VersionedStore<K: StoredObject> {
    kind: String,
    backend: Arc<dyn ObjectBackend<K>>,
    blobs: Option<Arc<dyn BlobStore>>,
    cache: Arc<RwLock<CacheState<K>>>,
    updates: mpsc::UnboundedSender<CacheUpdate<K>>,
    changes: broadcast::Sender<ObjectChange>,
    forwarder: JoinHandle<()>,
}

impl<K: StoredObject> VersionedStore<K> {
    /// Start a store over `backend` and wait for the initial listing
    pub async fn start(backend: Arc<dyn ObjectBackend<K>>) -> Result<Arc<Self>> {
        Self::start_with_backup(backend, None).await
    }

    /// Start a store that can also write backups to `blobs`
    pub async fn start_with_backup(
        backend: Arc<dyn ObjectBackend<K>>,
        blobs: Option<Arc<dyn BlobStore>>,
    ) -> Result<Arc<Self>> {
        let kind = K::kind(&()).to_string();
        let cache = Arc::new(RwLock::new(CacheState::default()));
        let (updates, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        tokio::spawn(cache::ingest(
            kind.clone(),
            cache.clone(),
            rx,
            changes.clone(),
        ));

        // Subscribe before listing so nothing between the two is missed
        let stream = backend.watch();
        let snapshot = backend.list().await?;
        acknowledge(&kind, &updates, WatchEvent::Restarted(snapshot)).await?;

        let forwarder = tokio::spawn(cache::forward(
            kind.clone(),
            backend.clone(),
            stream,
            updates.clone(),
        ));

        debug!(kind = %kind, "Store started");

        Ok(Arc::new(Self {
            kind,
            backend,
            blobs,
            cache,
            updates,
            changes,
            forwarder,
        }))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub async fn get(&self, key: &str) -> Result<K> {
        self.cache
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&self.kind, key))
    }

    pub async fn get_opt(&self, key: &str) -> Option<K> {
        self.cache.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<K> {
        self.cache.read().await.values().cloned().collect()
    }

    pub async fn create(&self, key: &str, mut obj: K) -> Result<K> {
        obj.meta_mut().name = Some(key.to_string());
        let created = self.backend.create(&obj).await?;
        self.acknowledge(WatchEvent::Added(created.clone())).await?;
        Ok(created)
    }

    /// Replace spec and metadata. Fails with `Conflict` when `obj` carries a
    /// stale resource version.
    pub async fn update(&self, key: &str, obj: K) -> Result<K> {
        let updated = self.backend.replace(key, &obj).await?;
        let event = if is_released(&updated) {
            WatchEvent::Deleted(updated.clone())
        } else {
            WatchEvent::Modified(updated.clone())
        };
        self.acknowledge(event).await?;
        Ok(updated)
    }

    pub async fn update_status(&self, key: &str, obj: K) -> Result<K> {
        let updated = self.backend.replace_status(key, &obj).await?;
        self.acknowledge(WatchEvent::Modified(updated.clone())).await?;
        Ok(updated)
    }

    /// Delete `key`. Objects with finalizers only become terminating.
    pub async fn delete(&self, key: &str) -> Result<DeleteOutcome<K>> {
        let outcome = self.backend.delete(key).await?;
        match &outcome {
            DeleteOutcome::Terminating(obj) => {
                self.acknowledge(WatchEvent::Modified(obj.clone())).await?;
            }
            DeleteOutcome::Removed(Some(obj)) => {
                self.acknowledge(WatchEvent::Deleted(obj.clone())).await?;
            }
            DeleteOutcome::Removed(None) => {
                if let Some(cached) = self.get_opt(key).await {
                    self.acknowledge(WatchEvent::Deleted(cached)).await?;
                }
            }
        }
        Ok(outcome)
    }

    /// Receive a notification for every change applied to the cache
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        self.changes.subscribe()
    }

    async fn acknowledge(&self, event: WatchEvent<K>) -> Result<()> {
        acknowledge(&self.kind, &self.updates, event).await
    }
}

impl<K: StoredObject> Drop for VersionedStore<K> {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn acknowledge<K: StoredObject>(
    kind: &str,
    updates: &mpsc::UnboundedSender<CacheUpdate<K>>,
    event: WatchEvent<K>,
) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    updates
        .send(CacheUpdate::Acknowledged(event, tx))
        .map_err(|_| StoreError::CacheClosed(kind.to_string()))?;
    rx.await
        .map_err(|_| StoreError::CacheClosed(kind.to_string()))
}
