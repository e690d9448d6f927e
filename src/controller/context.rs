use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use tracing::warn;

use crate::config::{DEFAULT_JOB_TIMEOUT, OperatorConfig};
use crate::controller::state_machine::LifecycleStateMachine;
use crate::crd::{FleetCluster, FleetDeployment, FleetWorkspace};
use crate::health::HealthState;
use crate::provision::{ProvisionError, Provisioner, WorkdirPreparer};
use crate::resources::IngressSettings;
use crate::store::VersionedStore;
use crate::worker::Worker;

/// Fleet-wide values for provisioning runs
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestrationSettings {
    pub job_timeout: Duration,
    pub certificate_arn: Option<String>,
    pub root_domain: Option<String>,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            certificate_arn: None,
            root_domain: None,
        }
    }
}

impl From<&OperatorConfig> for OrchestrationSettings {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            job_timeout: config.job_timeout,
            certificate_arn: config.certificate_arn.clone(),
            root_domain: config.root_domain.clone(),
        }
    }
}

/// Shared context for workspace and cluster orchestration
pub struct Context {
    pub workspaces: Arc<VersionedStore<FleetWorkspace>>,
    pub clusters: Arc<VersionedStore<FleetCluster>>,
    /// Jobs keyed by workspace name
    pub workspace_worker: Worker,
    /// Jobs keyed by cluster name
    pub cluster_worker: Worker,
    pub provisioner: Arc<dyn Provisioner>,
    pub workdirs: Arc<dyn WorkdirPreparer>,
    pub state_machine: LifecycleStateMachine,
    pub settings: OrchestrationSettings,
    /// Health state for recording metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        workspaces: Arc<VersionedStore<FleetWorkspace>>,
        clusters: Arc<VersionedStore<FleetCluster>>,
        provisioner: Arc<dyn Provisioner>,
        workdirs: Arc<dyn WorkdirPreparer>,
        settings: OrchestrationSettings,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            workspaces,
            clusters,
            workspace_worker: Worker::new("workspace"),
            cluster_worker: Worker::new("cluster"),
            provisioner,
            workdirs,
            state_machine: LifecycleStateMachine::new(),
            settings,
            health_state,
        }
    }

    /// Count a failed provisioning job
    pub fn record_failed_operation(&self, kind: &str, operation: &str) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_failed_operation(kind, operation);
        }
    }

    /// Prepare a working directory for tearing infrastructure down.
    ///
    /// A git ref that no longer exists falls back to the default branch, so
    /// resources created from a deleted branch can still be removed.
    pub async fn prepare_teardown_workdir(
        &self,
        state_name: &str,
        template: &str,
        git_ref: &str,
    ) -> Result<PathBuf, ProvisionError> {
        match self.workdirs.prepare(state_name, template, git_ref).await {
            Err(ProvisionError::ReferenceNotFound(missing)) if !git_ref.is_empty() => {
                warn!(
                    state = state_name,
                    git_ref = %missing,
                    "Git ref is gone, tearing down from the default branch"
                );
                self.workdirs.prepare(state_name, template, "").await
            }
            other => other,
        }
    }

    /// Publish the number of running jobs per worker
    pub fn record_active_jobs(&self) {
        if let Some(ref state) = self.health_state {
            for worker in [&self.workspace_worker, &self.cluster_worker] {
                state
                    .metrics
                    .set_active_jobs(worker.name(), worker.count_jobs() as i64);
            }
        }
    }
}

/// Shared context for the deployment reconcile loop
pub struct DeploymentContext {
    pub deployments: Arc<VersionedStore<FleetDeployment>>,
    /// Routes
    pub services: Arc<VersionedStore<Service>>,
    pub workloads: Arc<VersionedStore<Deployment>>,
    pub ingresses: Arc<VersionedStore<Ingress>>,
    pub claims: Arc<VersionedStore<PersistentVolumeClaim>>,
    /// Cluster-scoped, released by the finalizer
    pub volumes: Arc<VersionedStore<PersistentVolume>>,
    pub ingress: IngressSettings,
    /// Health state for recording metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
}
