use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::LifecycleState;

pub const DEFAULT_IMAGE_TAG: &str = "latest";
pub const DEFAULT_QUOTA_GROUP: &str = "small";

/// FleetWorkspace is a tenant environment provisioned on a FleetCluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[kube(
    group = "fleet.example.com",
    version = "v1alpha1",
    kind = "FleetWorkspace",
    plural = "fleetworkspaces",
    shortname = "fws",
    namespaced,
    status = "FleetWorkspaceStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.imageTag"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetWorkspaceSpec {
    /// Cluster hosting the workspace
    pub cluster_name: String,

    /// Git ref of the provisioning templates
    #[serde(default)]
    pub git_ref: String,

    /// Tag of the workspace API server image
    #[serde(default)]
    pub image_tag: String,

    /// Token clients use to reach the workspace API
    #[serde(default)]
    pub api_token: String,

    #[serde(default)]
    pub enable_web: bool,

    /// Resource quota tier
    #[serde(default)]
    pub quota_group: String,
}

impl FleetWorkspaceSpec {
    /// Fill in defaults for fields left empty
    pub fn with_defaults(mut self) -> Self {
        if self.image_tag.is_empty() {
            self.image_tag = DEFAULT_IMAGE_TAG.to_string();
        }
        if self.quota_group.is_empty() {
            self.quota_group = DEFAULT_QUOTA_GROUP.to_string();
        }
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetWorkspaceStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default)]
    pub last_state: LifecycleState,
    /// Unix seconds of the last status change
    #[serde(default)]
    pub updated_at: i64,
}
