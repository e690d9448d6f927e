use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::LifecycleState;

/// FleetCluster is the infrastructure that hosts workspaces
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[kube(
    group = "fleet.example.com",
    version = "v1alpha1",
    kind = "FleetCluster",
    plural = "fleetclusters",
    shortname = "fcl",
    namespaced,
    status = "FleetClusterStatus",
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Region", "type":"string", "jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetClusterSpec {
    /// Infrastructure provider, e.g. "aws"
    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub region: String,

    /// Git ref of the provisioning templates
    #[serde(default)]
    pub git_ref: String,

    /// Subdomain of the root domain served by this cluster
    #[serde(default)]
    pub subdomain: String,

    /// Environment label passed to provisioning, e.g. "prod"
    #[serde(default)]
    pub deployment_environment: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetClusterStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default)]
    pub last_state: LifecycleState,
    /// Unix seconds of the last status change
    #[serde(default)]
    pub updated_at: i64,

    /// Values reported by the last successful provisioning run
    #[serde(default)]
    pub properties: ClusterProperties,

    /// Workspaces registered on this cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProperties {
    #[serde(default)]
    pub vpc_id: String,
    #[serde(default)]
    pub oidc_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpc_public_subnets: Vec<String>,
}
