//! In-process backend with API-server semantics
//!
//! Emulates what the store relies on from Kubernetes: a global revision
//! counter, the status subresource, finalizer-gated deletion and optimistic
//! concurrency on `resource_version`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{DeleteOutcome, ObjectBackend, Result, StoreError, StoredObject, WatchEvent};

const EVENT_BUFFER: usize = 1024;

struct MemoryState<K> {
    objects: BTreeMap<String, K>,
    revision: u64,
}

impl<K> MemoryState<K> {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

pub struct MemoryBackend<K> {
    kind: String,
    state: Mutex<MemoryState<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: StoredObject> Default for MemoryBackend<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoredObject> MemoryBackend<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            kind: K::kind(&()).to_string(),
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                revision: 0,
            }),
            events,
        }
    }

    /// Backend pre-populated with `objects`, status included, as if they had
    /// been persisted by an earlier process
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let backend = Self::new();
        {
            let mut state = backend.state();
            for mut obj in objects {
                let revision = state.next_revision();
                let meta = obj.meta_mut();
                meta.resource_version = Some(revision);
                meta.uid.get_or_insert_with(new_uid);
                meta.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
                state.objects.insert(obj.name_any(), obj);
            }
        }
        backend
    }

    fn state(&self) -> MutexGuard<'_, MemoryState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Published while the state lock is held so subscribers see revision order
    fn publish(&self, event: WatchEvent<K>) {
        let _ = self.events.send(event);
    }

    fn check_revision(&self, current: &K, incoming: &K) -> Result<()> {
        match incoming.meta().resource_version.as_deref() {
            Some(expected) if Some(expected) != current.meta().resource_version.as_deref() => {
                Err(StoreError::conflict(&self.kind, &current.name_any()))
            }
            _ => Ok(()),
        }
    }
}

fn new_uid() -> String {
    let bits = rand::random::<u128>();
    let hex = format!("{bits:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn field<K: StoredObject>(obj: &K, name: &str) -> Result<Option<Value>> {
    Ok(serde_json::to_value(obj)?.get(name).cloned())
}

/// Copy of `obj` with its status replaced by `status`
fn with_status<K: StoredObject>(obj: &K, status: Option<Value>) -> Result<K> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status);
            }
            None => {
                map.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<K: StoredObject> ObjectBackend<K> for MemoryBackend<K> {
    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.state().objects.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.state()
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&self.kind, name))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| StoreError::Backend(format!("{} without a name", self.kind)))?;

        let mut created = with_status(obj, None)?;
        let mut state = self.state();
        if state.objects.contains_key(&name) {
            return Err(StoreError::already_exists(&self.kind, &name));
        }

        let revision = state.next_revision();
        let meta = created.meta_mut();
        meta.uid = Some(new_uid());
        meta.resource_version = Some(revision);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        meta.generation = Some(1);

        state.objects.insert(name, created.clone());
        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K> {
        let mut state = self.state();
        let current = state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&self.kind, name))?;
        self.check_revision(&current, obj)?;

        let spec_changed = field(&current, "spec")? != field(obj, "spec")?;
        let mut next = with_status(obj, field(&current, "status")?)?;
        let revision = state.next_revision();
        {
            let cur = current.meta();
            let meta = next.meta_mut();
            meta.name = cur.name.clone();
            meta.namespace = cur.namespace.clone();
            meta.uid = cur.uid.clone();
            meta.creation_timestamp = cur.creation_timestamp.clone();
            meta.deletion_timestamp = cur.deletion_timestamp.clone();
            meta.generation = cur.generation.map(|g| if spec_changed { g + 1 } else { g });
            meta.resource_version = Some(revision);
        }

        if next.meta().deletion_timestamp.is_some() && next.finalizers().is_empty() {
            state.objects.remove(name);
            self.publish(WatchEvent::Deleted(next.clone()));
        } else {
            state.objects.insert(name.to_string(), next.clone());
            self.publish(WatchEvent::Modified(next.clone()));
        }
        Ok(next)
    }

    async fn replace_status(&self, name: &str, obj: &K) -> Result<K> {
        let mut state = self.state();
        let current = state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&self.kind, name))?;
        self.check_revision(&current, obj)?;

        let mut next = with_status(&current, field(obj, "status")?)?;
        next.meta_mut().resource_version = Some(state.next_revision());

        state.objects.insert(name.to_string(), next.clone());
        self.publish(WatchEvent::Modified(next.clone()));
        Ok(next)
    }

    async fn delete(&self, name: &str) -> Result<DeleteOutcome<K>> {
        let mut state = self.state();
        let mut current = state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&self.kind, name))?;

        if current.finalizers().is_empty() {
            current.meta_mut().resource_version = Some(state.next_revision());
            state.objects.remove(name);
            self.publish(WatchEvent::Deleted(current.clone()));
            return Ok(DeleteOutcome::Removed(Some(current)));
        }

        if current.meta().deletion_timestamp.is_some() {
            return Ok(DeleteOutcome::Terminating(current));
        }

        let revision = state.next_revision();
        let meta = current.meta_mut();
        meta.deletion_timestamp = Some(Time(Utc::now()));
        meta.resource_version = Some(revision);

        state.objects.insert(name.to_string(), current.clone());
        self.publish(WatchEvent::Modified(current.clone()));
        Ok(DeleteOutcome::Terminating(current))
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let rx = self.events.subscribe();
        futures::stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Ok(event) => Some((Ok(event), Some(rx))),
                // Ending the stream after a gap forces a relist
                Err(RecvError::Lagged(skipped)) => Some((
                    Err(StoreError::Backend(format!(
                        "change stream lagged by {skipped} events"
                    ))),
                    None,
                )),
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}
