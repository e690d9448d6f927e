//! Workspace operations
//!
//! A workspace is recorded and registered on its cluster synchronously, then
//! provisioned by a job on the workspace worker keyed by workspace name. Job
//! outcomes only surface through status, the job log and the failure counter.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::controller::cluster::{register_workspace, try_unregister_workspace, unregister_workspace};
use crate::controller::context::Context;
use crate::controller::env::{
    WORKSPACE_TEMPLATE, workspace_env, workspace_state_name, workspace_teardown_env,
};
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{LifecycleEvent, TransitionResult};
use crate::controller::status::{HasLifecycle, StatusManager};
use crate::controller::validation::{merge_workspace_update, validate_name, validate_update_state};
use crate::crd::{FleetWorkspace, FleetWorkspaceSpec, LifecycleState};
use crate::provision::{ProvisionRequest, ignore_already_unlocked};
use crate::store::StoreError;
use crate::worker::{JobClaim, LogSink};

/// Label for this kind of resource in the failure counter
const KIND: &str = "workspace";

fn status(ctx: &Context) -> StatusManager<'_, FleetWorkspace> {
    StatusManager::new(&ctx.workspaces, &ctx.state_machine)
}

/// Cluster must exist and must not be going away
async fn require_cluster(ctx: &Context, cluster: &str) -> Result<()> {
    match ctx.clusters.get_opt(cluster).await {
        None => Err(Error::ValidationError(format!("cluster {cluster} does not exist"))),
        Some(c) if c.lifecycle() == LifecycleState::Deleting => Err(Error::StateError(format!(
            "cluster {cluster} is being deleted"
        ))),
        Some(_) => Ok(()),
    }
}

/// Record a new workspace, register it on its cluster and start provisioning
pub async fn create(
    ctx: &Arc<Context>,
    name: &str,
    spec: FleetWorkspaceSpec,
) -> Result<FleetWorkspace> {
    validate_name("workspace", name)?;
    let spec = spec.with_defaults();

    if ctx.workspaces.get_opt(name).await.is_some() {
        return Err(StoreError::already_exists(ctx.workspaces.kind(), name).into());
    }
    require_cluster(ctx, &spec.cluster_name).await?;
    let claim = claim(ctx, name).await?;

    let cluster = spec.cluster_name.clone();
    register_workspace(ctx, &cluster, name).await?;
    if let Err(e) = ctx.workspaces.create(name, FleetWorkspace::new(name, spec)).await {
        // Lost a race with another create of the same name
        if let Err(error) = unregister_workspace(ctx, &cluster, name).await {
            warn!(workspace = name, cluster = %cluster, %error, "Failed to roll back cluster registration");
        }
        return Err(e.into());
    }

    info!(workspace = name, cluster = %cluster, operation = "create", "Workspace accepted");

    start_create(ctx, name, claim).await?;
    Ok(ctx.workspaces.get(name).await?)
}

/// Start (or restart) the create job of a recorded workspace
pub async fn dispatch_create(ctx: &Arc<Context>, name: &str) -> Result<()> {
    let claim = claim(ctx, name).await?;
    start_create(ctx, name, claim).await
}

async fn start_create(ctx: &Arc<Context>, name: &str, claim: JobClaim) -> Result<()> {
    status(ctx).apply(name, LifecycleEvent::CreateRequested).await?;
    let state_name = workspace_state_name(name);
    if let Err(e) = ctx.provisioner.create_workspace(&state_name).await {
        if !e.is_already_exists() {
            return Err(e.into());
        }
        debug!(workspace = name, state = %state_name, "Provisioning state already exists");
    }
    start_apply_job(ctx, name, claim, "create");
    Ok(())
}

/// Change the updatable fields of a workspace and re-apply it
pub async fn update(
    ctx: &Arc<Context>,
    name: &str,
    requested: FleetWorkspaceSpec,
) -> Result<FleetWorkspace> {
    let workspace = ctx.workspaces.get(name).await?;
    validate_update_state("workspace", name, workspace.lifecycle())?;
    // Nothing is written unless the job slot is ours
    let claim = claim(ctx, name).await?;
    let mut workspace = ctx.workspaces.get(name).await?;
    validate_update_state("workspace", name, workspace.lifecycle())?;

    let previous_cluster = workspace.spec.cluster_name.clone();
    let merged = merge_workspace_update(&workspace.spec, &requested);
    let moved = merged.cluster_name != previous_cluster;
    if moved {
        require_cluster(ctx, &merged.cluster_name).await?;
        register_workspace(ctx, &merged.cluster_name, name).await?;
    }

    let target_cluster = merged.cluster_name.clone();
    workspace.spec = merged;
    if let Err(e) = ctx.workspaces.update(name, workspace).await {
        if moved {
            try_unregister_workspace(ctx, &target_cluster, name).await;
        }
        return Err(e.into());
    }
    if moved {
        try_unregister_workspace(ctx, &previous_cluster, name).await;
    }
    info!(workspace = name, operation = "update", "Workspace update accepted");

    start_update(ctx, name, claim).await?;
    Ok(ctx.workspaces.get(name).await?)
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

/// Tear a workspace down and remove it
pub async fn delete(ctx: &Arc<Context>, name: &str) -> Result<()> {
    ctx.workspaces.get(name).await?;
    dispatch_delete(ctx, name).await
}

pub async fn dispatch_delete(ctx: &Arc<Context>, name: &str) -> Result<()> {
    let job_ctx = ctx.clone();
    let fail_ctx = ctx.clone();
    let key = name.to_string();
    let fail_key = name.to_string();

    ctx.workspace_worker
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

pub async fn get(ctx: &Context, name: &str) -> Result<FleetWorkspace> {
    Ok(ctx.workspaces.get(name).await?)
}

pub async fn list(ctx: &Context) -> Vec<FleetWorkspace> {
    ctx.workspaces.list().await
}

async fn claim(ctx: &Context, name: &str) -> Result<JobClaim> {
    Ok(ctx.workspace_worker.claim(ctx.settings.job_timeout, name).await?)
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

async fn apply(ctx: &Context, name: &str, log: &LogSink) -> Result<()> {
    let workspace = ctx.workspaces.get(name).await?;
    let cluster = ctx.clusters.get(&workspace.spec.cluster_name).await?;
    let state_name = workspace_state_name(name);

    let result: Result<()> = async {
        let dir = ctx
            .workdirs
            .prepare(&state_name, WORKSPACE_TEMPLATE, &workspace.spec.git_ref)
            .await?;
        ignore_already_unlocked(ctx.provisioner.force_unlock(&state_name).await)?;

        let request = ProvisionRequest {
            workspace: state_name.clone(),
            dir,
            env: workspace_env(&workspace, &cluster, &ctx.settings),
        };
        ctx.provisioner.apply(&request, log).await?;
        status(ctx).apply(name, LifecycleEvent::JobSucceeded).await?;
        Ok(())
    }
    .await;

    ctx.workdirs.cleanup(&state_name).await;
    if result.is_ok() {
        info!(workspace = name, "Workspace is ready");
    }
    result
}

async fn teardown(ctx: &Context, name: &str, log: &LogSink) -> Result<()> {
    let Some(workspace) = ctx.workspaces.get_opt(name).await else {
        debug!(workspace = name, "Workspace already removed");
        return Ok(());
    };
    status(ctx).apply(name, LifecycleEvent::DeleteRequested).await?;
    info!(workspace = name, operation = "delete", "Tearing workspace down");

    let cluster_name = workspace.spec.cluster_name.clone();
    let cluster = ctx.clusters.get(&cluster_name).await?;
    let state_name = workspace_state_name(name);

    let result: Result<()> = async {
        let dir = ctx
            .prepare_teardown_workdir(&state_name, WORKSPACE_TEMPLATE, &workspace.spec.git_ref)
            .await?;
        ignore_already_unlocked(ctx.provisioner.force_unlock(&state_name).await)?;

        let request = ProvisionRequest {
            workspace: state_name.clone(),
            dir,
            env: workspace_teardown_env(&workspace, &cluster),
        };
        ctx.provisioner.destroy(&request, log).await?;
        Ok(())
    }
    .await;
    ctx.workdirs.cleanup(&state_name).await;
    result?;

    try_unregister_workspace(ctx, &cluster_name, name).await;

    match ctx.provisioner.delete_workspace(&state_name).await {
        Err(e) if !e.is_not_found() => return Err(e.into()),
        _ => {}
    }

    if let TransitionResult::Removed { .. } = status(ctx).apply(name, LifecycleEvent::JobSucceeded).await? {
        ctx.workspaces.delete(name).await?;
    }
    info!(workspace = name, "Workspace deleted");
    Ok(())
}
