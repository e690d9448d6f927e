//! Drain and self-upgrade
//!
//! The operator upgrades itself by patching the image tag of its own
//! Deployment. It first stops accepting jobs on every worker and waits until
//! none is running, so no provisioning run is cut off by the restart. After a
//! successful patch the workers stay locked until the process is replaced;
//! requests arriving meanwhile are refused and replayed by the new process.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use kube::api::PostParams;
use tracing::{error, info};

use crate::controller::error::{Error, Result};
use crate::worker::{DrainGuard, Worker};

/// How often a drain re-checks for running jobs
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Lock every worker and return the guards once none has a running job.
///
/// Between checks the locks are released so running jobs can finish.
pub async fn wait_for_idle(workers: &[&Worker], poll: Duration) -> Vec<DrainGuard> {
    loop {
        let mut guards = Vec::with_capacity(workers.len());
        for worker in workers {
            guards.push(worker.lock().await);
        }

        let running: usize = workers.iter().map(|w| w.count_jobs()).sum();
        info!(running, "Checking for running jobs");
        if running == 0 {
            return guards;
        }

        drop(guards);
        tokio::time::sleep(poll).await;
    }
}

/// Replace the tag of a container image reference, keeping registry and
/// repository. A digest is dropped.
pub fn update_image_tag(image: &str, tag: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let repository = match without_digest.rfind(':') {
        // A colon before the last slash belongs to a registry port
        Some(i) if !without_digest[i..].contains('/') => &without_digest[..i],
        _ => without_digest,
    };
    format!("{repository}:{tag}")
}

/// Points the running operator at a new image
#[async_trait]
pub trait ImageUpdater: Send + Sync {
    async fn update_image_tag(&self, tag: &str) -> Result<()>;
}

/// Patches the operator's own Deployment
pub struct KubeImageUpdater {
    api: Api<Deployment>,
    name: String,
}

impl KubeImageUpdater {
    pub fn new(api: Api<Deployment>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }
}

#[async_trait]
impl ImageUpdater for KubeImageUpdater {
    async fn update_image_tag(&self, tag: &str) -> Result<()> {
        let mut deployment = self.api.get(&self.name).await?;
        let container = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|p| p.containers.first_mut())
            .ok_or_else(|| {
                Error::ValidationError(format!("deployment {} has no containers", self.name))
            })?;

        let current = container.image.clone().unwrap_or_default();
        container.image = Some(update_image_tag(&current, tag));
        self.api
            .replace(&self.name, &PostParams::default(), &deployment)
            .await?;
        Ok(())
    }
}

/// Drain the workers, then apply the new tag. A failed update releases the
/// workers and retries after `poll`.
///
/// Returns the guards of the drain that preceded the successful update.
pub async fn upgrade_when_idle(
    workers: &[&Worker],
    updater: &dyn ImageUpdater,
    tag: &str,
    poll: Duration,
) -> Vec<DrainGuard> {
    info!(image_tag = tag, "Upgrade requested, draining workers");
    loop {
        let guards = wait_for_idle(workers, poll).await;
        match updater.update_image_tag(tag).await {
            Ok(()) => {
                info!(image_tag = tag, "Image updated, waiting to be replaced");
                return guards;
            }
            Err(e) => {
                error!(image_tag = tag, error = %e, "Failed to update image tag, will retry");
                drop(guards);
                tokio::time::sleep(poll).await;
            }
        }
    }
}

/// Upgrade and keep the workers locked until the process is replaced
pub async fn run_self_upgrade(
    workers: &[&Worker],
    updater: &dyn ImageUpdater,
    tag: &str,
    poll: Duration,
) {
    let _guards = upgrade_when_idle(workers, updater, tag, poll).await;
    std::future::pending::<()>().await;
}
