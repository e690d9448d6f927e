//! Shared file system storage for deployments with mounts
//!
//! Each mount gets a PersistentVolume backed by the EFS CSI driver and a claim
//! bound to it. Volumes are cluster-scoped and cannot carry an owner reference
//! to a namespaced deployment, so they are found by label and released by the
//! finalizer.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::FleetDeployment;
use crate::resources::common::{owner_reference, standard_labels};

pub const EFS_CSI_DRIVER: &str = "efs.csi.aws.com";

/// Label carrying the namespace of the deployment a volume belongs to
pub const NAMESPACE_LABEL: &str = "fleet.example.com/namespace";

/// Nominal size; EFS is elastic and ignores it
const NOMINAL_CAPACITY: &str = "10Gi";

const ACCESS_MODE: &str = "ReadWriteMany";

pub fn volume_name(namespace: &str, deployment_name: &str, index: usize) -> String {
    format!("{namespace}-{deployment_name}-pv-{index}")
}

pub fn claim_name(deployment_name: &str, index: usize) -> String {
    format!("{deployment_name}-pvc-{index}")
}

/// Storage is only provisioned when the deployment has mounts and a file system
pub fn has_volumes(deployment: &FleetDeployment) -> bool {
    deployment.spec.efs_id.is_some() && !deployment.spec.mounts.is_empty()
}

fn volume_labels(deployment: &FleetDeployment) -> BTreeMap<String, String> {
    let mut labels = standard_labels(&deployment.name_any());
    labels.insert(
        NAMESPACE_LABEL.to_string(),
        deployment.namespace().unwrap_or_default(),
    );
    labels
}

/// Whether `volume` was provisioned for `deployment`
pub fn belongs_to(volume: &PersistentVolume, deployment: &FleetDeployment) -> bool {
    let labels = volume.labels();
    let expected = volume_labels(deployment);
    [crate::resources::common::DEPLOYMENT_LABEL, NAMESPACE_LABEL]
        .iter()
        .all(|key| labels.get(*key) == expected.get(*key))
}

/// Generate a volume and its claim for every mount
pub fn generate_volumes(
    deployment: &FleetDeployment,
) -> Vec<(PersistentVolume, PersistentVolumeClaim)> {
    if !has_volumes(deployment) {
        return Vec::new();
    }
    let name = deployment.name_any();
    let namespace = deployment.namespace().unwrap_or_default();
    let efs_id = deployment.spec.efs_id.clone().unwrap_or_default();
    let capacity = BTreeMap::from([(
        "storage".to_string(),
        Quantity(NOMINAL_CAPACITY.to_string()),
    )]);

    deployment
        .spec
        .mounts
        .iter()
        .enumerate()
        .map(|(i, mount)| {
            let pv_name = volume_name(&namespace, &name, i);
            let volume_handle = match &deployment.spec.efs_access_point_id {
                Some(ap) => format!("{efs_id}:{}:{ap}", mount.path),
                None => format!("{efs_id}:{}", mount.path),
            };

            let volume = PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(pv_name.clone()),
                    labels: Some(volume_labels(deployment)),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    capacity: Some(capacity.clone()),
                    access_modes: Some(vec![ACCESS_MODE.to_string()]),
                    persistent_volume_reclaim_policy: Some("Retain".to_string()),
                    storage_class_name: Some(String::new()),
                    csi: Some(CSIPersistentVolumeSource {
                        driver: EFS_CSI_DRIVER.to_string(),
                        volume_handle,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let claim = PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(claim_name(&name, i)),
                    namespace: Some(namespace.clone()),
                    labels: Some(standard_labels(&name)),
                    owner_references: Some(vec![owner_reference(deployment)]),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec![ACCESS_MODE.to_string()]),
                    storage_class_name: Some(String::new()),
                    volume_name: Some(pv_name),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(capacity.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            };

            (volume, claim)
        })
        .collect()
}
