//! Startup recovery
//!
//! Jobs are never persisted, so work interrupted by a restart is found again
//! from the recorded lifecycle state and dispatched anew. Replaying a
//! provisioning action is safe: "already exists" and "already unlocked" count
//! as success.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{error, info};

use crate::controller::cluster;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::status::HasLifecycle;
use crate::controller::workspace;
use crate::crd::LifecycleState;

/// Work dispatched for a recorded state, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryAction {
    Create,
    Update,
    Delete,
}

impl RecoveryAction {
    pub fn for_state(state: LifecycleState) -> Option<Self> {
        match state {
            LifecycleState::Unknown | LifecycleState::Creating => Some(RecoveryAction::Create),
            LifecycleState::Updating => Some(RecoveryAction::Update),
            LifecycleState::Deleting => Some(RecoveryAction::Delete),
            LifecycleState::Ready | LifecycleState::Failed => None,
        }
    }
}

/// What recovery dispatched
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    pub workspaces: Vec<(String, RecoveryAction)>,
    pub clusters: Vec<(String, RecoveryAction)>,
    /// Dispatches that failed; recovery carries on past them
    pub failures: usize,
}

/// Replay interrupted work and rebuild each cluster's workspace list.
///
/// Runs once at boot, before requests are served.
pub async fn recover(ctx: &Arc<Context>) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    info!("Recovering interrupted work");

    for cl in ctx.clusters.list().await {
        let name = cl.name_any();
        let Some(action) = RecoveryAction::for_state(cl.lifecycle()) else {
            continue;
        };
        info!(cluster = %name, ?action, "Restarting cluster job");
        let result = match action {
            RecoveryAction::Create => cluster::dispatch_create(ctx, &name).await,
            RecoveryAction::Update => cluster::dispatch_update(ctx, &name).await,
            RecoveryAction::Delete => cluster::dispatch_delete(ctx, &name).await,
        };
        match result {
            Ok(()) => report.clusters.push((name, action)),
            Err(e) => {
                error!(cluster = %name, ?action, error = %e, "Failed to restart cluster job");
                report.failures += 1;
            }
        }
    }

    let mut hosted: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for ws in ctx.workspaces.list().await {
        let name = ws.name_any();
        hosted
            .entry(ws.spec.cluster_name.clone())
            .or_default()
            .push(name.clone());

        let Some(action) = RecoveryAction::for_state(ws.lifecycle()) else {
            continue;
        };
        info!(workspace = %name, ?action, "Restarting workspace job");
        let result = match action {
            RecoveryAction::Create => workspace::dispatch_create(ctx, &name).await,
            RecoveryAction::Update => workspace::dispatch_update(ctx, &name).await,
            RecoveryAction::Delete => workspace::dispatch_delete(ctx, &name).await,
        };
        match result {
            Ok(()) => report.workspaces.push((name, action)),
            Err(e) => {
                error!(workspace = %name, ?action, error = %e, "Failed to restart workspace job");
                report.failures += 1;
            }
        }
    }

    if let Err(e) = rebuild_cluster_workspaces(ctx, hosted).await {
        error!(error = %e, "Failed to rebuild cluster workspace lists");
        report.failures += 1;
    }

    info!(
        workspaces = report.workspaces.len(),
        clusters = report.clusters.len(),
        failures = report.failures,
        "Recovery finished"
    );
    report
}

/// Make every cluster's workspace list match the workspace store
async fn rebuild_cluster_workspaces(
    ctx: &Context,
    mut hosted: BTreeMap<String, Vec<String>>,
) -> Result<()> {
    for cl in ctx.clusters.list().await {
        let name = cl.name_any();
        let mut workspaces = hosted.remove(&name).unwrap_or_default();
        workspaces.sort();
        cluster::modify_status(ctx, &name, |status| {
            let mut current = status.workspaces.clone();
            current.sort();
            if current == workspaces {
                false
            } else {
                status.workspaces = workspaces.clone();
                true
            }
        })
        .await?;
    }

    for (cluster_name, orphans) in hosted {
        error!(cluster = %cluster_name, workspaces = ?orphans, "Workspaces refer to a missing cluster");
    }
    Ok(())
}
