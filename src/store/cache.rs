//! Single-writer cache behind [`super::VersionedStore`]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use kube::ResourceExt;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    ObjectBackend, ObjectChange, RESUBSCRIBE_DELAY, Result, StoredObject, WatchEvent, revision_of,
};

/// How long a deletion keeps blocking older events for the same name once
/// the change stream has moved past it
const TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Input to the ingest task
pub(crate) enum CacheUpdate<K> {
    /// Event from the backend change stream
    Observed(WatchEvent<K>),
    /// Result of a local write; the sender is notified once applied
    Acknowledged(WatchEvent<K>, oneshot::Sender<()>),
}

struct Tombstone {
    revision: u64,
    recorded: Instant,
}

pub(crate) struct CacheState<K> {
    objects: HashMap<String, K>,
    /// Names deleted recently, with the revision of the deletion
    tombstones: HashMap<String, Tombstone>,
    /// Highest revision delivered by the change stream
    observed: u64,
    /// Names written locally since a relist began; `None` outside a relist
    relist_writes: Option<HashSet<String>>,
}

impl<K> Default for CacheState<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            tombstones: HashMap::new(),
            observed: 0,
            relist_writes: None,
        }
    }
}

fn event_name<K: StoredObject>(event: &WatchEvent<K>) -> Option<String> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
            Some(obj.name_any())
        }
        WatchEvent::Relisting | WatchEvent::Restarted(_) => None,
    }
}

impl<K: StoredObject> CacheState<K> {
    pub(crate) fn get(&self, name: &str) -> Option<&K> {
        self.objects.get(name)
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &K> {
        self.objects.values()
    }

    /// Apply an event from the change stream, returning the changes that were
    /// actually made
    pub(crate) fn apply(&mut self, event: WatchEvent<K>) -> Vec<ObjectChange> {
        let revision = match &event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                revision_of(obj)
            }
            WatchEvent::Relisting | WatchEvent::Restarted(_) => None,
        };

        let changes = self.apply_event(event);

        if let Some(revision) = revision {
            self.observed = self.observed.max(revision);
            self.prune_tombstones();
        }
        changes
    }

    /// Apply the result of a local write
    pub(crate) fn acknowledge(&mut self, event: WatchEvent<K>) -> Vec<ObjectChange> {
        if let (Some(writes), Some(name)) = (self.relist_writes.as_mut(), event_name(&event)) {
            writes.insert(name);
        }
        self.apply_event(event)
    }

    fn apply_event(&mut self, event: WatchEvent<K>) -> Vec<ObjectChange> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                self.upsert(obj).into_iter().collect()
            }
            WatchEvent::Deleted(obj) => self.remove(obj).into_iter().collect(),
            WatchEvent::Relisting => {
                self.relist_writes = Some(HashSet::new());
                Vec::new()
            }
            WatchEvent::Restarted(objs) => self.restart(objs),
        }
    }

    fn upsert(&mut self, obj: K) -> Option<ObjectChange> {
        let name = obj.name_any();
        let revision = revision_of(&obj);

        if let (Some(tombstone), Some(rev)) = (self.tombstones.get(&name), revision) {
            if rev <= tombstone.revision {
                return None;
            }
            self.tombstones.remove(&name);
        }

        if let Some(current) = self.objects.get(&name)
            && let (Some(cur), Some(rev)) = (revision_of(current), revision)
            && rev <= cur
        {
            return None;
        }

        let change = ObjectChange::applied(&obj);
        self.objects.insert(name, obj);
        Some(change)
    }

    fn remove(&mut self, obj: K) -> Option<ObjectChange> {
        let name = obj.name_any();
        let revision = revision_of(&obj);

        // A newer incarnation under the same name is already cached
        if let Some(current) = self.objects.get(&name)
            && let (Some(cur), Some(rev)) = (revision_of(current), revision)
            && cur > rev
        {
            return None;
        }

        if let Some(rev) = revision {
            let recorded = Instant::now();
            self.tombstones
                .entry(name.clone())
                .and_modify(|t| {
                    t.revision = t.revision.max(rev);
                    t.recorded = recorded;
                })
                .or_insert(Tombstone {
                    revision: rev,
                    recorded,
                });
        }

        self.objects
            .remove(&name)
            .map(|removed| ObjectChange::removed(&removed))
    }

    /// Replace the contents with `objs`. Names absent from the snapshot are
    /// dropped unless they were written locally after the relist began.
    fn restart(&mut self, objs: Vec<K>) -> Vec<ObjectChange> {
        let written = self.relist_writes.take().unwrap_or_default();
        let present: HashSet<String> = objs.iter().map(|o| o.name_any()).collect();

        let missing: Vec<String> = self
            .objects
            .keys()
            .filter(|name| !present.contains(*name) && !written.contains(*name))
            .cloned()
            .collect();

        let mut changes = Vec::new();
        for name in missing {
            if let Some(obj) = self.objects.remove(&name) {
                changes.push(ObjectChange::removed(&obj));
            }
        }

        // Deletions made during the relist still hold back stale snapshot entries
        self.tombstones.retain(|name, _| written.contains(name));
        for obj in objs {
            changes.extend(self.upsert(obj));
        }

        changes
    }

    fn prune_tombstones(&mut self) {
        let observed = self.observed;
        self.tombstones
            .retain(|_, t| t.revision >= observed || t.recorded.elapsed() < TOMBSTONE_TTL);
    }
}

/// Apply updates to the cache until every sender is gone
pub(crate) async fn ingest<K: StoredObject>(
    kind: String,
    cache: Arc<RwLock<CacheState<K>>>,
    mut updates: mpsc::UnboundedReceiver<CacheUpdate<K>>,
    changes: broadcast::Sender<ObjectChange>,
) {
    while let Some(update) = updates.recv().await {
        let (applied, ack) = match update {
            CacheUpdate::Observed(event) => (cache.write().await.apply(event), None),
            CacheUpdate::Acknowledged(event, ack) => {
                (cache.write().await.acknowledge(event), Some(ack))
            }
        };

        for change in applied {
            // No subscribers is fine
            let _ = changes.send(change);
        }

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    debug!(kind = %kind, "Cache ingest stopped");
}

/// Forward backend events into the ingest task, re-establishing the stream
/// whenever it breaks
pub(crate) async fn forward<K: StoredObject>(
    kind: String,
    backend: Arc<dyn ObjectBackend<K>>,
    mut stream: BoxStream<'static, Result<WatchEvent<K>>>,
    updates: mpsc::UnboundedSender<CacheUpdate<K>>,
) {
    loop {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    if updates.send(CacheUpdate::Observed(event)).is_err() {
                        return;
                    }
                }
                Err(error) => {
                    warn!(kind = %kind, %error, "Change stream error");
                }
            }
        }

        // Retry until a fresh stream and a full listing are both in hand
        loop {
            warn!(
                kind = %kind,
                "Change stream ended, re-establishing in {:?}",
                RESUBSCRIBE_DELAY
            );
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;

            stream = backend.watch();
            if updates
                .send(CacheUpdate::Observed(WatchEvent::Relisting))
                .is_err()
            {
                return;
            }
            match backend.list().await {
                Ok(snapshot) => {
                    if updates
                        .send(CacheUpdate::Observed(WatchEvent::Restarted(snapshot)))
                        .is_err()
                    {
                        return;
                    }
                    break;
                }
                Err(error) => {
                    warn!(kind = %kind, %error, "Failed to relist after stream restart");
                }
            }
        }
    }
}
