//! Kubernetes API server backend

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, future};
use kube::Api;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};

use super::{DeleteOutcome, ObjectBackend, Result, StoreError, StoredObject, WatchEvent};

/// Backend over a kube [`Api`]; namespaced or cluster-wide depending on how
/// the `Api` was built
pub struct KubeBackend<K> {
    api: Api<K>,
    kind: String,
}

impl<K: StoredObject> KubeBackend<K> {
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            kind: K::kind(&()).to_string(),
        }
    }

    fn map_error(&self, name: &str, err: kube::Error) -> StoreError {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::not_found(&self.kind, name),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::already_exists(&self.kind, name)
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::conflict(&self.kind, name),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[async_trait]
impl<K: StoredObject> ObjectBackend<K> for KubeBackend<K> {
    async fn list(&self) -> Result<Vec<K>> {
        self.api
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.api
            .get(name)
            .await
            .map_err(|e| self.map_error(name, e))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| self.map_error(&name, e))
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K> {
        self.api
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| self.map_error(name, e))
    }

    async fn replace_status(&self, name: &str, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj)?;
        self.api
            .replace_status(name, &PostParams::default(), data)
            .await
            .map_err(|e| self.map_error(name, e))
    }

    async fn delete(&self, name: &str) -> Result<DeleteOutcome<K>> {
        let outcome = self
            .api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| self.map_error(name, e))?;

        // Left: still present with a deletion timestamp. Right: gone.
        Ok(match outcome.left() {
            Some(obj) => DeleteOutcome::Terminating(obj),
            None => DeleteOutcome::Removed(None),
        })
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let config = watcher::Config::default().any_semantic();

        // Initial pages are buffered so a relist reaches the cache as one event
        watcher::watcher(self.api.clone(), config)
            .default_backoff()
            .scan(Vec::new(), |pending: &mut Vec<K>, event| {
                let item = match event {
                    Ok(Event::Init) => {
                        pending.clear();
                        Some(Ok(WatchEvent::Relisting))
                    }
                    Ok(Event::InitApply(obj)) => {
                        pending.push(obj);
                        None
                    }
                    Ok(Event::InitDone) => Some(Ok(WatchEvent::Restarted(std::mem::take(pending)))),
                    Ok(Event::Apply(obj)) => Some(Ok(WatchEvent::Modified(obj))),
                    Ok(Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Err(e) => Some(Err(StoreError::Backend(e.to_string()))),
                };
                future::ready(Some(item))
            })
            .filter_map(future::ready)
            .boxed()
    }
}
