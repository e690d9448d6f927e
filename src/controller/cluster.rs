//! Cluster operations
//!
//! Requests are validated and recorded synchronously; provisioning runs as a
//! job on the cluster worker, keyed by cluster name.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::env::{CLUSTER_TEMPLATE, cluster_env, cluster_state_name};
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{LifecycleEvent, TransitionResult};
use crate::controller::status::{HasLifecycle, MAX_STATUS_ATTEMPTS, StatusManager};
use crate::controller::validation::{validate_name, validate_update_state};
use crate::crd::{ClusterProperties, FleetCluster, FleetClusterSpec, FleetClusterStatus};
use crate::provision::{ProvisionRequest, ignore_already_exists, ignore_already_unlocked};
use crate::store::StoreError;
use crate::worker::{JobClaim, LogSink};

/// Label for this kind of resource in the failure counter
const KIND: &str = "cluster";

fn status(ctx: &Context) -> StatusManager<'_, FleetCluster> {
    StatusManager::new(&ctx.clusters, &ctx.state_machine)
}

/// Register a new cluster and start provisioning it
pub async fn create(ctx: &Arc<Context>, name: &str, spec: FleetClusterSpec) -> Result<FleetCluster> {
    validate_name("cluster", name)?;
    if ctx.clusters.get_opt(name).await.is_some() {
        return Err(StoreError::already_exists(ctx.clusters.kind(), name).into());
    }
    let claim = claim(ctx, name).await?;

    ctx.clusters.create(name, FleetCluster::new(name, spec)).await?;
    info!(cluster = name, operation = "create", "Cluster accepted");

    start_create(ctx, name, claim).await?;
    Ok(ctx.clusters.get(name).await?)
}

/// Start (or restart) the create job of a recorded cluster
pub async fn dispatch_create(ctx: &Arc<Context>, name: &str) -> Result<()> {
    let claim = claim(ctx, name).await?;
    start_create(ctx, name, claim).await
}

async fn start_create(ctx: &Arc<Context>, name: &str, claim: JobClaim) -> Result<()> {
    status(ctx).apply(name, LifecycleEvent::CreateRequested).await?;
    let state_name = cluster_state_name(name);
    ignore_already_exists(ctx.provisioner.create_workspace(&state_name).await)?;
    start_apply_job(ctx, name, claim, "create");
    Ok(())
}

/// Change a cluster's spec and re-apply it.
///
/// Provider and region are fixed at creation.
pub async fn update(ctx: &Arc<Context>, name: &str, spec: FleetClusterSpec) -> Result<FleetCluster> {
    let cluster = ctx.clusters.get(name).await?;
    validate_update_state("cluster", name, cluster.lifecycle())?;
    let claim = claim(ctx, name).await?;
    let mut cluster = ctx.clusters.get(name).await?;
    validate_update_state("cluster", name, cluster.lifecycle())?;

    cluster.spec.git_ref = spec.git_ref;
    cluster.spec.subdomain = spec.subdomain;
    cluster.spec.deployment_environment = spec.deployment_environment;
    ctx.clusters.update(name, cluster).await?;
    info!(cluster = name, operation = "update", "Cluster update accepted");

    start_update(ctx, name, claim).await?;
    Ok(ctx.clusters.get(name).await?)
}

pub async fn dispatch_update(ctx: &Arc<Context>, name: &str) -> Result<()> {
    let claim = claim(ctx, name).await?;
    start_update(ctx, name, claim).await
}

async fn start_update(ctx: &Arc<Context>, name: &str, claim: JobClaim) -> Result<()> {
    status(ctx).apply(name, LifecycleEvent::UpdateRequested).await?;
    start_apply_job(ctx, name, claim, "update");
    Ok(())
}

/// Tear a cluster down. Refused while it still hosts workspaces.
pub async fn delete(ctx: &Arc<Context>, name: &str) -> Result<()> {
    let cluster = ctx.clusters.get(name).await?;

    let mut hosted: Vec<String> = cluster
        .status
        .as_ref()
        .map(|s| s.workspaces.clone())
        .unwrap_or_default();
    for ws in ctx.workspaces.list().await {
        if ws.spec.cluster_name == name && !hosted.contains(&ws.name_any()) {
            hosted.push(ws.name_any());
        }
    }
    if !hosted.is_empty() {
        hosted.sort();
        return Err(Error::StateError(format!(
            "cluster {name} still hosts workspaces: {}",
            hosted.join(", ")
        )));
    }

    dispatch_delete(ctx, name).await
}

pub async fn dispatch_delete(ctx: &Arc<Context>, name: &str) -> Result<()> {
    let job_ctx = ctx.clone();
    let fail_ctx = ctx.clone();
    let key = name.to_string();
    let fail_key = name.to_string();

    ctx.cluster_worker
        .create_job(
            ctx.settings.job_timeout,
            name,
            move |log| async move { teardown(&job_ctx, &key, &log).await },
            move || async move {
                status(&fail_ctx).mark_failed(&fail_key).await;
                fail_ctx.record_failed_operation(KIND, "delete");
            },
        )
        .await?;
    Ok(())
}

pub async fn get(ctx: &Context, name: &str) -> Result<FleetCluster> {
    Ok(ctx.clusters.get(name).await?)
}

pub async fn list(ctx: &Context) -> Vec<FleetCluster> {
    ctx.clusters.list().await
}

async fn claim(ctx: &Context, name: &str) -> Result<JobClaim> {
    Ok(ctx.cluster_worker.claim(ctx.settings.job_timeout, name).await?)
}

fn start_apply_job(ctx: &Arc<Context>, name: &str, claim: JobClaim, operation: &'static str) {
    let job_ctx = ctx.clone();
    let fail_ctx = ctx.clone();
    let key = name.to_string();
    let fail_key = name.to_string();

    claim.start(
        move |log| async move { apply(&job_ctx, &key, &log).await },
        move || async move {
            status(&fail_ctx).mark_failed(&fail_key).await;
            fail_ctx.record_failed_operation(KIND, operation);
        },
    );
}

/// Create or update the infrastructure of `name`, then record its outputs
async fn apply(ctx: &Context, name: &str, log: &LogSink) -> Result<()> {
    let cluster = ctx.clusters.get(name).await?;
    let state_name = cluster_state_name(name);

    let result: Result<()> = async {
        let dir = ctx
            .workdirs
            .prepare(&state_name, CLUSTER_TEMPLATE, &cluster.spec.git_ref)
            .await?;
        ignore_already_unlocked(ctx.provisioner.force_unlock(&state_name).await)?;

        let request = ProvisionRequest {
            workspace: state_name.clone(),
            dir,
            env: cluster_env(&cluster, &ctx.settings),
        };
        let output = ctx.provisioner.apply(&request, log).await?;

        let properties = ClusterProperties {
            vpc_id: output.string("vpc_id").unwrap_or_default(),
            oidc_id: output.string("oidc_id").unwrap_or_default(),
            vpc_public_subnets: output.strings("vpc_public_subnets"),
        };
        status(ctx)
            .apply_with(name, LifecycleEvent::JobSucceeded, |c: &mut FleetCluster| {
                if let Some(status) = c.status.as_mut() {
                    status.properties = properties.clone();
                }
            })
            .await?;
        Ok(())
    }
    .await;

    ctx.workdirs.cleanup(&state_name).await;
    if result.is_ok() {
        info!(cluster = name, "Cluster is ready");
    }
    result
}

async fn teardown(ctx: &Context, name: &str, log: &LogSink) -> Result<()> {
    let Some(cluster) = ctx.clusters.get_opt(name).await else {
        debug!(cluster = name, "Cluster already removed");
        return Ok(());
    };
    status(ctx).apply(name, LifecycleEvent::DeleteRequested).await?;
    info!(cluster = name, operation = "delete", "Tearing cluster down");

    let state_name = cluster_state_name(name);
    let result: Result<()> = async {
        let dir = ctx
            .prepare_teardown_workdir(&state_name, CLUSTER_TEMPLATE, &cluster.spec.git_ref)
            .await?;
        ignore_already_unlocked(ctx.provisioner.force_unlock(&state_name).await)?;

        let request = ProvisionRequest {
            workspace: state_name.clone(),
            dir,
            env: cluster_env(&cluster, &ctx.settings),
        };
        ctx.provisioner.destroy(&request, log).await?;

        match ctx.provisioner.delete_workspace(&state_name).await {
            Err(e) if !e.is_not_found() => return Err(e.into()),
            _ => {}
        }
        Ok(())
    }
    .await;
    ctx.workdirs.cleanup(&state_name).await;
    result?;

    if let TransitionResult::Removed { .. } = status(ctx).apply(name, LifecycleEvent::JobSucceeded).await? {
        ctx.clusters.delete(name).await?;
    }
    info!(cluster = name, "Cluster deleted");
    Ok(())
}

/// Change a cluster's status with compare-and-swap.
///
/// `modify` returns whether it changed anything; nothing is written otherwise.
pub(crate) async fn modify_status<F>(ctx: &Context, name: &str, modify: F) -> Result<()>
where
    F: Fn(&mut FleetClusterStatus) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut cluster = ctx.clusters.get(name).await?;
        if !modify(cluster.status.get_or_insert_with(Default::default)) {
            return Ok(());
        }
        match ctx.clusters.update_status(name, cluster).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < MAX_STATUS_ATTEMPTS => {
                debug!(cluster = name, attempt, "Cluster status write conflicted, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Add `workspace` to the cluster's workspace list
pub(crate) async fn register_workspace(ctx: &Context, cluster: &str, workspace: &str) -> Result<()> {
    modify_status(ctx, cluster, |status| {
        if status.workspaces.iter().any(|w| w == workspace) {
            false
        } else {
            status.workspaces.push(workspace.to_string());
            true
        }
    })
    .await
}

/// Remove `workspace` from the cluster's workspace list
pub(crate) async fn unregister_workspace(ctx: &Context, cluster: &str, workspace: &str) -> Result<()> {
    modify_status(ctx, cluster, |status| {
        let before = status.workspaces.len();
        status.workspaces.retain(|w| w != workspace);
        status.workspaces.len() != before
    })
    .await
}

/// Unregister, logging instead of failing; the workspace is gone either way
pub(crate) async fn try_unregister_workspace(ctx: &Context, cluster: &str, workspace: &str) {
    if let Err(error) = unregister_workspace(ctx, cluster, workspace).await {
        warn!(cluster, workspace, %error, "Failed to remove workspace from cluster");
    }
}
