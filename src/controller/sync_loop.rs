//! Change-driven reconcile loop for deployments
//!
//! Changes to a deployment, or to any child it owns, queue the deployment's
//! name. A name is queued at most once however many changes arrive before it
//! is processed, and names are reconciled one at a time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kube::ResourceExt;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::context::DeploymentContext;
use crate::controller::error::ErrorContext;
use crate::controller::reconciler::{RETRY_INTERVAL, reconcile_deployment};
use crate::crd::FleetDeployment;
use crate::resources::common::KIND;
use crate::store::{ObjectChange, VersionedStore};

/// Names waiting to be reconciled, each at most once
#[derive(Clone)]
struct WorkQueue {
    pending: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<String>,
}

impl WorkQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            pending: Arc::new(Mutex::new(HashSet::new())),
            tx,
        };
        (queue, rx)
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, name: &str) {
        if self.pending().insert(name.to_string()) {
            let _ = self.tx.send(name.to_string());
        }
    }

    /// Mark `name` as taken so changes seen from now on queue it again
    fn take(&self, name: &str) {
        self.pending().remove(name);
    }
}

/// Which deployment a change concerns
type Route = fn(&ObjectChange) -> Option<String>;

fn route_deployment(change: &ObjectChange) -> Option<String> {
    Some(change.name.clone())
}

fn route_owner(change: &ObjectChange) -> Option<String> {
    change.owner_of_kind(KIND).map(str::to_string)
}

async fn forward(
    source: &'static str,
    mut changes: Receiver<ObjectChange>,
    route: Route,
    queue: WorkQueue,
    deployments: Arc<VersionedStore<FleetDeployment>>,
) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                if let Some(name) = route(&change) {
                    queue.push(&name);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(source, skipped, "Change feed lagged, requeueing every deployment");
                for deployment in deployments.list().await {
                    queue.push(&deployment.name_any());
                }
            }
            Err(RecvError::Closed) => {
                debug!(source, "Change feed closed");
                return;
            }
        }
    }
}

/// Reconciles deployments as changes arrive
pub struct ReconcileLoop {
    ctx: Arc<DeploymentContext>,
}

impl ReconcileLoop {
    pub fn new(ctx: Arc<DeploymentContext>) -> Self {
        Self { ctx }
    }

    /// Run until the task is cancelled
    pub async fn run(self) {
        let (queue, mut rx) = WorkQueue::new();
        let ctx = self.ctx;

        let feeds: Vec<(&'static str, Receiver<ObjectChange>, Route)> = vec![
            ("deployments", ctx.deployments.subscribe(), route_deployment as Route),
            ("services", ctx.services.subscribe(), route_owner as Route),
            ("workloads", ctx.workloads.subscribe(), route_owner as Route),
            ("ingresses", ctx.ingresses.subscribe(), route_owner as Route),
            ("claims", ctx.claims.subscribe(), route_owner as Route),
        ];
        let forwarders: Vec<JoinHandle<()>> = feeds
            .into_iter()
            .map(|(source, changes, route)| {
                tokio::spawn(forward(
                    source,
                    changes,
                    route,
                    queue.clone(),
                    ctx.deployments.clone(),
                ))
            })
            .collect();

        // Objects that existed before subscribing
        for deployment in ctx.deployments.list().await {
            queue.push(&deployment.name_any());
        }
        info!("Reconcile loop started");

        let mut errors: HashMap<String, ErrorContext> = HashMap::new();
        // The queue keeps a sender, so this only ends if the task is cancelled
        while let Some(name) = rx.recv().await {
            queue.take(&name);

            match reconcile_deployment(&name, &ctx).await {
                Ok(()) => {
                    if errors.remove(&name).is_some() {
                        info!(deployment = %name, "Reconcile recovered");
                    }
                }
                Err(error) => {
                    let Some(deployment) = ctx.deployments.get_opt(&name).await else {
                        // Gone while failing; nothing left to retry
                        errors.remove(&name);
                        debug!(deployment = %name, %error, "Reconcile failed for a removed deployment");
                        continue;
                    };

                    let entry = errors.entry(name.clone()).or_default();
                    entry.record_error(&error);
                    if entry.should_warn() {
                        warn!(
                            deployment = %name,
                            %error,
                            attempts = entry.consecutive_errors,
                            retryable = error.is_retryable(),
                            "Reconcile failed"
                        );
                    } else {
                        debug!(deployment = %name, %error, "Reconcile failed again");
                    }
                    if let Some(ref state) = ctx.health_state {
                        let namespace = deployment.namespace().unwrap_or_default();
                        state.metrics.record_error(&namespace, &name);
                    }

                    let queue = queue.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(RETRY_INTERVAL).await;
                        queue.push(&name);
                    });
                }
            }
        }

        for forwarder in forwarders {
            forwarder.abort();
        }
    }
}
