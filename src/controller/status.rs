//! Status management for workspaces and clusters
//!
//! Lifecycle changes go through the transition table and are written with
//! compare-and-swap. A write that loses a race re-reads the object and retries,
//! so concurrent status writers never overwrite each other's changes.

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{LifecycleEvent, LifecycleStateMachine, TransitionResult};
use crate::crd::{FleetCluster, FleetWorkspace, LifecycleState};
use crate::store::{StoredObject, VersionedStore};

/// Attempts of a compare-and-swap status write before giving up
pub const MAX_STATUS_ATTEMPTS: u32 = 5;

/// A stored object that moves through [`LifecycleState`]
pub trait HasLifecycle: StoredObject {
    fn lifecycle(&self) -> LifecycleState;

    /// Record `state`, remembering the previous one
    fn set_lifecycle(&mut self, state: LifecycleState, now: i64);
}

impl HasLifecycle for FleetWorkspace {
    fn lifecycle(&self) -> LifecycleState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    fn set_lifecycle(&mut self, state: LifecycleState, now: i64) {
        let status = self.status.get_or_insert_with(Default::default);
        status.last_state = status.state;
        status.state = state;
        status.updated_at = now;
    }
}

impl HasLifecycle for FleetCluster {
    fn lifecycle(&self) -> LifecycleState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    fn set_lifecycle(&mut self, state: LifecycleState, now: i64) {
        let status = self.status.get_or_insert_with(Default::default);
        status.last_state = status.state;
        status.state = state;
        status.updated_at = now;
    }
}

/// Applies lifecycle events to objects in one store
pub struct StatusManager<'a, K: HasLifecycle> {
    store: &'a VersionedStore<K>,
    machine: &'a LifecycleStateMachine,
}

impl<'a, K: HasLifecycle> StatusManager<'a, K> {
    pub fn new(store: &'a VersionedStore<K>, machine: &'a LifecycleStateMachine) -> Self {
        Self { store, machine }
    }

    /// Apply `event` to the object called `name`
    pub async fn apply(&self, name: &str, event: LifecycleEvent) -> Result<TransitionResult> {
        self.apply_with(name, event, |_| {}).await
    }

    /// Apply `event` and `mutate` the status in the same write.
    ///
    /// A transition into [`TransitionResult::Removed`] writes nothing; the
    /// caller removes the object. Invalid transitions are a `StateError`.
    pub async fn apply_with<F>(
        &self,
        name: &str,
        event: LifecycleEvent,
        mutate: F,
    ) -> Result<TransitionResult>
    where
        F: Fn(&mut K),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut obj = self.store.get(name).await?;
            let current = obj.lifecycle();

            let result = self.machine.transition(current, event);
            let to = match result {
                TransitionResult::Success { to, .. } => to,
                TransitionResult::Removed { .. } => return Ok(result),
                TransitionResult::InvalidTransition { .. } => {
                    return Err(Error::StateError(format!(
                        "{} {} cannot handle {} while {}",
                        self.store.kind(),
                        name,
                        event,
                        current
                    )));
                }
            };

            obj.set_lifecycle(to, Utc::now().timestamp());
            mutate(&mut obj);

            match self.store.update_status(name, obj).await {
                Ok(updated) => {
                    debug!(
                        kind = self.store.kind(),
                        name = %updated.name_any(),
                        from = %current,
                        to = %to,
                        %event,
                        "Status updated"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_conflict() && attempt < MAX_STATUS_ATTEMPTS => {
                    debug!(kind = self.store.kind(), name, attempt, "Status write conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record a failed job. Errors are logged, not returned: the job outcome
    /// is already decided.
    pub async fn mark_failed(&self, name: &str) {
        match self.apply(name, LifecycleEvent::JobFailed).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(kind = self.store.kind(), name, "Object vanished before it could be marked failed");
            }
            Err(error) => {
                warn!(kind = self.store.kind(), name, %error, "Failed to mark object as failed");
            }
        }
    }
}
