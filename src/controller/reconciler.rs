//! Reconciliation logic for FleetDeployment resources
//!
//! One pass brings the children of a deployment (route, workload, ingress
//! rules and storage) in line with its spec and refreshes its status. A pass
//! is idempotent: unchanged children are never written.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use crate::controller::context::DeploymentContext;
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::observe_deployment;
use crate::crd::{DeploymentState, Endpoint, FleetDeployment, FleetDeploymentStatus};
use crate::resources::common::KIND;
use crate::resources::ingress::{
    generate_ingresses, header_ingress_name, host_ingress_name, patch_ingress,
};
use crate::resources::service::{generate_service, patch_service, service_name};
use crate::resources::volume::{belongs_to, generate_volumes};
use crate::resources::workload::{generate_workload, patch_workload, replica_counts, workload_name};
use crate::store::{StoredObject, VersionedStore};

/// Finalizer blocking removal until children are released
pub const FINALIZER: &str = "fleet.example.com/deletion";

/// Delay before a failed reconcile is retried
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Reconcile the deployment called `name`
#[instrument(skip(ctx))]
pub async fn reconcile_deployment(name: &str, ctx: &DeploymentContext) -> Result<()> {
    let started = Instant::now();

    let Some(deployment) = ctx.deployments.get_opt(name).await else {
        debug!("Deployment is gone, nothing to do");
        return Ok(());
    };
    let namespace = deployment.namespace().unwrap_or_default();
    let terminating = deployment.meta().deletion_timestamp.is_some();

    let deployment = refresh_status(deployment, ctx, terminating).await?;

    if terminating {
        finalize(&deployment, ctx).await?;
    } else {
        let deployment = ensure_finalizer(deployment, ctx).await?;
        sync_children(&deployment, ctx).await?;
    }

    if let Some(ref state) = ctx.health_state {
        state
            .metrics
            .record_reconcile(&namespace, name, started.elapsed().as_secs_f64());
        state
            .last_reconcile
            .store(Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
    }
    Ok(())
}

/// In-cluster address of a deployment
pub fn internal_endpoint(deployment: &FleetDeployment) -> String {
    format!(
        "http://{}.{}.svc.cluster.local:{}",
        service_name(&deployment.name_any()),
        deployment.namespace().unwrap_or_default(),
        deployment.spec.port
    )
}

fn desired_status(
    deployment: &FleetDeployment,
    ctx: &DeploymentContext,
    state: DeploymentState,
) -> FleetDeploymentStatus {
    let current = deployment.status.clone().unwrap_or_default();
    let mut status = current.clone();
    if state != current.state {
        status.last_state = current.state;
        status.state = state;
        status.updated_at = Utc::now().timestamp();
    }

    let external_endpoint = if state == DeploymentState::Deleting {
        String::new()
    } else {
        ctx.ingress
            .host(deployment)
            .map(|host| format!("https://{host}"))
            .unwrap_or_default()
    };
    status.endpoint = Endpoint {
        internal_endpoint: internal_endpoint(deployment),
        external_endpoint,
    };
    status
}

/// Recompute state and endpoint, writing only when something changed
async fn refresh_status(
    deployment: FleetDeployment,
    ctx: &DeploymentContext,
    terminating: bool,
) -> Result<FleetDeployment> {
    let name = deployment.name_any();
    let workload = ctx
        .workloads
        .get_opt(&workload_name(&name))
        .await
        .map(|w| replica_counts(&w));
    let state = observe_deployment(terminating, workload, deployment.state());

    let status = desired_status(&deployment, ctx, state);
    if deployment.status.as_ref() == Some(&status) {
        return Ok(deployment);
    }

    if deployment.state() != state {
        info!(from = %deployment.state(), to = %state, "Deployment state changed");
    }
    let mut updated = deployment;
    updated.status = Some(status);
    Ok(ctx.deployments.update_status(&name, updated).await?)
}

async fn ensure_finalizer(
    mut deployment: FleetDeployment,
    ctx: &DeploymentContext,
) -> Result<FleetDeployment> {
    if deployment.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(deployment);
    }
    debug!("Adding finalizer");
    deployment.finalizers_mut().push(FINALIZER.to_string());
    let name = deployment.name_any();
    Ok(ctx.deployments.update(&name, deployment).await?)
}

async fn delete_if_present<K: StoredObject>(store: &VersionedStore<K>, name: &str) -> Result<()> {
    match store.delete(name).await {
        Ok(_) => {
            debug!(kind = store.kind(), child = name, "Deleted child");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(Error::FinalizerError(format!(
            "failed to delete {} {name}: {e}",
            store.kind()
        ))),
    }
}

fn owned_by(obj: &impl Resource, deployment: &FleetDeployment) -> bool {
    let name = deployment.name_any();
    obj.owner_references()
        .iter()
        .any(|owner| owner.kind == KIND && owner.name == name)
}

/// Release every child, then drop the finalizer.
///
/// Any failure aborts the pass; the next one starts over from the beginning.
async fn finalize(deployment: &FleetDeployment, ctx: &DeploymentContext) -> Result<()> {
    let name = deployment.name_any();
    info!("Finalizing deployment");

    delete_if_present(&ctx.ingresses, &header_ingress_name(&name)).await?;
    delete_if_present(&ctx.ingresses, &host_ingress_name(&name)).await?;
    delete_if_present(&ctx.services, &service_name(&name)).await?;
    delete_if_present(&ctx.workloads, &workload_name(&name)).await?;

    for claim in ctx.claims.list().await {
        if owned_by(&claim, deployment) && claim.namespace() == deployment.namespace() {
            delete_if_present(&ctx.claims, &claim.name_any()).await?;
        }
    }
    for volume in ctx.volumes.list().await {
        if belongs_to(&volume, deployment) {
            delete_if_present(&ctx.volumes, &volume.name_any()).await?;
        }
    }

    let mut latest = ctx.deployments.get(&name).await?;
    let before = latest.finalizers().len();
    latest.finalizers_mut().retain(|f| f != FINALIZER);
    if latest.finalizers().len() != before {
        ctx.deployments
            .update(&name, latest)
            .await
            .map_err(|e| Error::FinalizerError(format!("failed to remove finalizer: {e}")))?;
        info!("Finalizer removed");
    }
    Ok(())
}

/// Create `desired` or patch the existing object through `patch`, which
/// reports whether it changed anything
async fn apply_child<K, P>(store: &VersionedStore<K>, desired: K, patch: P) -> Result<()>
where
    K: StoredObject,
    P: FnOnce(&mut K, &K) -> bool,
{
    let name = desired.name_any();
    match store.get_opt(&name).await {
        None => {
            store.create(&name, desired).await?;
            info!(kind = store.kind(), child = %name, "Created child");
        }
        Some(mut existing) => {
            if patch(&mut existing, &desired) {
                store.update(&name, existing).await?;
                info!(kind = store.kind(), child = %name, "Patched child");
            }
        }
    }
    Ok(())
}

async fn sync_children(deployment: &FleetDeployment, ctx: &DeploymentContext) -> Result<()> {
    let name = deployment.name_any();

    // Storage first so the workload's claims exist when its pods schedule
    for (volume, claim) in generate_volumes(deployment) {
        // Volume and claim specs are immutable once bound
        apply_child(&ctx.volumes, volume, |_, _| false).await?;
        apply_child(&ctx.claims, claim, |_, _| false).await?;
    }

    apply_child(&ctx.services, generate_service(deployment), patch_service).await?;
    apply_child(&ctx.workloads, generate_workload(deployment), patch_workload).await?;

    let ingresses = generate_ingresses(deployment, &ctx.ingress);
    let host_ingress = host_ingress_name(&name);
    if !ingresses.iter().any(|i| i.name_any() == host_ingress) {
        delete_if_present(&ctx.ingresses, &host_ingress).await?;
    }
    for ingress in ingresses {
        apply_child(&ctx.ingresses, ingress, patch_ingress).await?;
    }
    Ok(())
}
