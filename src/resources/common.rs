//! Common utilities for child resource generation
//!
//! Shared labels and ownership helpers so every child of a FleetDeployment is
//! found by the reconcile loop and garbage collected with its parent.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::FleetDeployment;

/// API version for FleetDeployment CRD
pub const API_VERSION: &str = "fleet.example.com/v1alpha1";

/// Kind for FleetDeployment CRD
pub const KIND: &str = "FleetDeployment";

/// Operator name used as field manager and `managed-by` label
pub const FIELD_MANAGER: &str = "fleet-operator";

/// Label carrying the owning deployment's name
pub const DEPLOYMENT_LABEL: &str = "fleet.example.com/deployment";

/// Generate an owner reference for a FleetDeployment
pub fn owner_reference(deployment: &FleetDeployment) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: deployment.name_any(),
        uid: deployment.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels set on every child of a deployment
pub fn standard_labels(deployment_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(deployment_name);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels
}

/// Labels identifying a deployment's pods
pub fn selector_labels(deployment_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            deployment_name.to_string(),
        ),
        (DEPLOYMENT_LABEL.to_string(), deployment_name.to_string()),
    ])
}
