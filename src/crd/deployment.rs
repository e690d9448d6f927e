use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::DeploymentState;

/// FleetDeployment is a model server running inside a workspace namespace
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.example.com",
    version = "v1alpha1",
    kind = "FleetDeployment",
    plural = "fleetdeployments",
    shortname = "fd",
    namespaced,
    status = "FleetDeploymentStatus",
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".status.endpoint.externalEndpoint"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetDeploymentSpec {
    /// Identifier of the packaged model being served
    pub photon_id: String,

    /// Container image of the model server
    pub image: String,

    /// Number of replicas to run
    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,

    /// Port the model server listens on
    #[serde(default = "default_port")]
    pub port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvVar>,

    /// Shared-filesystem paths mounted into every replica
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Workspace the deployment belongs to, used for its public hostname
    pub workspace_name: String,

    /// Domain under which the deployment gets a public hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_domain: Option<String>,

    /// Certificate for the load balancer terminating TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_arn: Option<String>,

    /// Shared filesystem backing `mounts`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efs_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efs_access_point_id: Option<String>,
}

fn default_min_replicas() -> i32 {
    1
}

fn default_port() -> i32 {
    8080
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirement {
    /// CPU cores per replica
    #[serde(default)]
    pub cpu: f64,

    /// Memory per replica in MiB
    #[serde(default)]
    pub memory_mib: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_type: Option<String>,

    #[serde(default)]
    pub accelerator_num: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Path on the shared filesystem
    pub path: String,
    /// Path inside the container
    pub mount_path: String,
}

/// Status of a FleetDeployment
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetDeploymentStatus {
    #[serde(default)]
    pub state: DeploymentState,

    /// State before the most recent change
    #[serde(default)]
    pub last_state: DeploymentState,

    /// Unix seconds of the last status change
    #[serde(default)]
    pub updated_at: i64,

    #[serde(default)]
    pub endpoint: Endpoint,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub internal_endpoint: String,
    #[serde(default)]
    pub external_endpoint: String,
}

impl FleetDeployment {
    /// Current state, `Unknown` when no status was ever written
    pub fn state(&self) -> DeploymentState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
