//! Environment handed to provisioning template scripts
//!
//! Pure builders, kept apart from the jobs so the exact variables can be
//! checked without running anything.

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::controller::context::OrchestrationSettings;
use crate::crd::{FleetCluster, FleetWorkspace};

/// Environment label used when a cluster does not set one
pub const DEFAULT_DEPLOYMENT_ENVIRONMENT: &str = "TEST";

/// Template directory for workspace infrastructure
pub const WORKSPACE_TEMPLATE: &str = "workspace";
/// Template directory for cluster infrastructure
pub const CLUSTER_TEMPLATE: &str = "cluster";

/// Provisioning-state workspace of a fleet workspace
pub fn workspace_state_name(name: &str) -> String {
    format!("ws-{name}")
}

/// Provisioning-state workspace of a cluster
pub fn cluster_state_name(name: &str) -> String {
    format!("cl-{name}")
}

/// Mount targets of the workspace file system, one per public subnet, as an
/// HCL map literal
pub fn efs_mount_targets(subnets: &[String]) -> String {
    let targets: Vec<String> = subnets
        .iter()
        .enumerate()
        .map(|(i, subnet)| format!(r#""az-{i}"={{"subnet_id"="{subnet}"}}"#))
        .collect();
    format!("{{{}}}", targets.join(","))
}

fn deployment_environment(cluster: &FleetCluster) -> String {
    if cluster.spec.deployment_environment.is_empty() {
        DEFAULT_DEPLOYMENT_ENVIRONMENT.to_string()
    } else {
        cluster.spec.deployment_environment.clone()
    }
}

fn insert_optional(env: &mut BTreeMap<String, String>, key: &str, value: &Option<String>) {
    if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
        env.insert(key.to_string(), value.to_string());
    }
}

/// Variables shared by workspace apply and destroy
fn workspace_base_env(workspace: &FleetWorkspace, cluster: &FleetCluster) -> BTreeMap<String, String> {
    let properties = cluster
        .status
        .as_ref()
        .map(|s| s.properties.clone())
        .unwrap_or_default();

    BTreeMap::from([
        ("CLUSTER_NAME".to_string(), cluster.name_any()),
        ("WORKSPACE_NAME".to_string(), workspace.name_any()),
        ("CREATE_EFS".to_string(), "true".to_string()),
        ("VPC_ID".to_string(), properties.vpc_id),
        (
            "EFS_MOUNT_TARGETS".to_string(),
            efs_mount_targets(&properties.vpc_public_subnets),
        ),
    ])
}

/// Environment for creating or updating a workspace
pub fn workspace_env(
    workspace: &FleetWorkspace,
    cluster: &FleetCluster,
    settings: &OrchestrationSettings,
) -> BTreeMap<String, String> {
    let spec = &workspace.spec;
    let oidc_id = cluster
        .status
        .as_ref()
        .map(|s| s.properties.oidc_id.clone())
        .unwrap_or_default();

    let mut env = workspace_base_env(workspace, cluster);
    env.extend([
        ("DEPLOYMENT_ENVIRONMENT".to_string(), deployment_environment(cluster)),
        ("IMAGE_TAG".to_string(), spec.image_tag.clone()),
        ("API_TOKEN".to_string(), spec.api_token.clone()),
        ("OIDC_ID".to_string(), oidc_id),
        ("WEB_ENABLED".to_string(), spec.enable_web.to_string()),
        ("QUOTA_GROUP".to_string(), spec.quota_group.clone()),
    ]);
    insert_optional(&mut env, "TLS_CERT_ARN_ID", &settings.certificate_arn);
    insert_optional(&mut env, "ROOT_DOMAIN", &settings.root_domain);
    env
}

/// Environment for tearing a workspace down
pub fn workspace_teardown_env(
    workspace: &FleetWorkspace,
    cluster: &FleetCluster,
) -> BTreeMap<String, String> {
    workspace_base_env(workspace, cluster)
}

/// Environment for creating, updating or tearing down a cluster
pub fn cluster_env(cluster: &FleetCluster, settings: &OrchestrationSettings) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("CLUSTER_NAME".to_string(), cluster.name_any()),
        ("REGION".to_string(), cluster.spec.region.clone()),
        ("CLUSTER_SUBDOMAIN".to_string(), cluster.spec.subdomain.clone()),
        ("DEPLOYMENT_ENVIRONMENT".to_string(), deployment_environment(cluster)),
    ]);
    insert_optional(&mut env, "ROOT_DOMAIN", &settings.root_domain);
    insert_optional(&mut env, "TLS_CERT_ARN_ID", &settings.certificate_arn);
    env
}
