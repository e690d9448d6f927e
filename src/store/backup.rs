//! Point-in-time backups of a store's key space
//!
//! Every backup serializes all objects of one kind into a [`BackupRecord`] and
//! writes it to a fresh blob under `backups/<kind>/<unix-millis>.json`. Earlier
//! blobs are never touched, so a failed backup leaves the last good one intact.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{StoreError, StoredObject, VersionedStore};
use crate::health::HealthState;

/// Root of every backup key
pub const BACKUP_PREFIX: &str = "backups";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blob {0} not found")]
    NotFound(String),

    #[error("blob {0} already exists")]
    AlreadyExists(String),

    #[error("no blob store configured for {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Something that can write a backup of itself
#[async_trait]
pub trait Backup: Send + Sync {
    /// Write a new backup, returning the key it was stored under
    async fn backup(&self) -> Result<String, BackupError>;
}

/// Durable blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a new blob. Fails with `AlreadyExists` instead of replacing one.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BackupError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, BackupError>;
    async fn delete(&self, key: &str) -> Result<(), BackupError>;
    /// Keys starting with `prefix`, in no particular order
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackupError>;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub kind: String,
    pub taken_at: DateTime<Utc>,
    pub items: Vec<serde_json::Value>,
}

impl BackupRecord {
    pub fn objects<K: DeserializeOwned>(&self) -> Result<Vec<K>, BackupError> {
        self.items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(BackupError::from))
            .collect()
    }
}

/// Keys tried for backups taken in the same millisecond
const MAX_KEY_ATTEMPTS: u32 = 16;

/// Key of a backup of `kind`. Backups sharing a timestamp are told apart by
/// `attempt`, which is left out of the key when zero.
pub fn backup_key(kind: &str, taken_at: DateTime<Utc>, attempt: u32) -> String {
    let millis = taken_at.timestamp_millis();
    let stem = if attempt == 0 {
        millis.to_string()
    } else {
        format!("{millis}-{attempt}")
    };
    format!("{}/{}/{}.json", BACKUP_PREFIX, kind.to_lowercase(), stem)
}

/// Timestamp and attempt encoded in a backup key
fn key_order(key: &str) -> Option<(i64, u32)> {
    let stem = key.rsplit('/').next()?.strip_suffix(".json")?;
    match stem.split_once('-') {
        Some((millis, attempt)) => Some((millis.parse().ok()?, attempt.parse().ok()?)),
        None => Some((stem.parse().ok()?, 0)),
    }
}

/// Write `data` under the first free key for `kind` at `taken_at`
async fn put_new(
    blobs: &dyn BlobStore,
    kind: &str,
    taken_at: DateTime<Utc>,
    data: Vec<u8>,
) -> Result<String, BackupError> {
    let mut attempt = 0;
    loop {
        let key = backup_key(kind, taken_at, attempt);
        match blobs.put(&key, data.clone()).await {
            Ok(()) => return Ok(key),
            Err(BackupError::AlreadyExists(_)) if attempt + 1 < MAX_KEY_ATTEMPTS => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn kind_prefix(kind: &str) -> String {
    format!("{}/{}/", BACKUP_PREFIX, kind.to_lowercase())
}

#[async_trait]
impl<K: StoredObject> Backup for VersionedStore<K> {
    async fn backup(&self) -> Result<String, BackupError> {
        let blobs = self
            .blobs
            .as_ref()
            .ok_or_else(|| BackupError::NotConfigured(self.kind.clone()))?;

        let items = self
            .list()
            .await
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let record = BackupRecord {
            kind: self.kind.clone(),
            taken_at: Utc::now(),
            items,
        };
        let data = serde_json::to_vec_pretty(&record)?;
        let key = put_new(&**blobs, &self.kind, record.taken_at, data).await?;

        debug!(kind = %self.kind, key = %key, objects = record.items.len(), "Backup written");
        Ok(key)
    }
}

/// Read the newest backup of `kind`, if there is one
pub async fn restore_latest(
    blobs: &dyn BlobStore,
    kind: &str,
) -> Result<Option<BackupRecord>, BackupError> {
    let latest = blobs
        .list(&kind_prefix(kind))
        .await?
        .into_iter()
        .filter_map(|key| Some((key_order(&key)?, key)))
        .max_by_key(|(order, _)| *order);

    let Some((_, key)) = latest else {
        return Ok(None);
    };

    let data = blobs.get(&key).await?;
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Re-create every object in `record` that is missing from `store`, with its
/// saved status. Returns how many objects were restored.
pub async fn restore_into<K: StoredObject>(
    store: &VersionedStore<K>,
    record: &BackupRecord,
) -> Result<usize, BackupError> {
    let mut restored = 0;

    for mut obj in record.objects::<K>()? {
        let name = obj.name_any();
        if store.get_opt(&name).await.is_some() {
            continue;
        }

        let has_status = serde_json::to_value(&obj)?
            .get("status")
            .is_some_and(|s| !s.is_null());

        let meta = obj.meta_mut();
        meta.resource_version = None;
        meta.uid = None;
        meta.creation_timestamp = None;
        meta.deletion_timestamp = None;

        let created = match store.create(&name, obj.clone()).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => continue,
            Err(e) => return Err(e.into()),
        };

        if has_status {
            obj.meta_mut().resource_version = created.resource_version();
            store.update_status(&name, obj).await?;
        }

        info!(kind = %record.kind, name = %name, "Restored object from backup");
        restored += 1;
    }

    Ok(restored)
}

/// Blobs stored as files under a root directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BackupError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers only ever see complete blobs. Linking fails if the key is
        // taken, where a rename would replace it.
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{:016x}.tmp", rand::random::<u64>()));
        tokio::fs::write(&tmp, data).await?;
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        tokio::fs::remove_file(&tmp).await?;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BackupError::AlreadyExists(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackupError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BackupError> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackupError> {
        let mut keys = Vec::new();
        let mut dirs = vec![self.root.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    dirs.push(path);
                    continue;
                }
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    continue;
                }
                if let Some(key) = self.key(&path)
                    && key.starts_with(prefix)
                {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }
}

/// Blobs kept in memory
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BackupError> {
        match self.blobs().entry(key.to_string()) {
            Entry::Occupied(_) => Err(BackupError::AlreadyExists(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(data);
                Ok(())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackupError> {
        self.blobs()
            .get(key)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BackupError> {
        self.blobs().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackupError> {
        Ok(self
            .blobs()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Source of delays for the periodic backup loop
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How often backups run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupPolicy {
    /// Delay after a successful backup
    pub interval: Duration,
    /// Delay after a failed backup
    pub retry_interval: Duration,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(12 * 60 * 60),
            retry_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Back up `target` now and then forever on `policy`. Failures are logged and
/// retried sooner; they never end the loop.
pub async fn run_periodic_backup(
    name: String,
    target: Arc<dyn Backup>,
    policy: BackupPolicy,
    clock: Arc<dyn Clock>,
    health_state: Option<Arc<HealthState>>,
) {
    info!(target_name = %name, "Starting periodic backup");

    loop {
        let delay = match target.backup().await {
            Ok(key) => {
                info!(target_name = %name, key = %key, "Backup succeeded");
                if let Some(ref state) = health_state {
                    state.metrics.record_backup(&name, true);
                }
                policy.interval
            }
            Err(error) => {
                warn!(
                    target_name = %name,
                    %error,
                    "Backup failed, retrying in {:?}",
                    policy.retry_interval
                );
                if let Some(ref state) = health_state {
                    state.metrics.record_backup(&name, false);
                }
                policy.retry_interval
            }
        };

        clock.sleep(delay).await;
    }
}
