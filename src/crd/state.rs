use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Observed health of a FleetDeployment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum DeploymentState {
    /// Never observed
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Workload is coming up for the first time
    Starting,
    /// All observed replicas are ready
    Running,
    /// No replica is ready after having run before
    #[serde(rename = "Not Ready")]
    NotReady,
    /// Some replicas are ready while a rollout is in progress
    Updating,
    /// Deletion was requested
    Deleting,
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentState::Unknown => write!(f, "Unknown"),
            DeploymentState::Starting => write!(f, "Starting"),
            DeploymentState::Running => write!(f, "Running"),
            DeploymentState::NotReady => write!(f, "Not Ready"),
            DeploymentState::Updating => write!(f, "Updating"),
            DeploymentState::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Lifecycle of a provisioned resource (workspace or cluster)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Accepted but not yet picked up
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Infrastructure is being created
    Creating,
    /// Last provisioning run succeeded
    Ready,
    /// Infrastructure is being changed
    Updating,
    /// Infrastructure is being torn down
    Deleting,
    /// Last provisioning run failed
    Failed,
}

impl LifecycleState {
    /// No job is expected to be running in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Failed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Unknown => write!(f, "Unknown"),
            LifecycleState::Creating => write!(f, "Creating"),
            LifecycleState::Ready => write!(f, "Ready"),
            LifecycleState::Updating => write!(f, "Updating"),
            LifecycleState::Deleting => write!(f, "Deleting"),
            LifecycleState::Failed => write!(f, "Failed"),
        }
    }
}
