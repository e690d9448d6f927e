//! Workload (apps/v1 Deployment) running a deployment's replicas

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::state_machine::ReplicaCounts;
use crate::crd::{FleetDeployment, ResourceRequirement};
use crate::resources::common::{owner_reference, selector_labels, standard_labels};
use crate::resources::volume::{claim_name, has_volumes};

/// Name of the serving container; always first in the pod
pub const MAIN_CONTAINER: &str = "main";

/// Extended resource name for accelerators
pub const ACCELERATOR_RESOURCE: &str = "nvidia.com/gpu";

/// The workload shares its deployment's name
pub fn workload_name(deployment_name: &str) -> String {
    deployment_name.to_string()
}

fn resource_requirements(req: &ResourceRequirement) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    if req.cpu > 0.0 {
        limits.insert("cpu".to_string(), Quantity(req.cpu.to_string()));
    }
    if req.memory_mib > 0 {
        limits.insert("memory".to_string(), Quantity(format!("{}Mi", req.memory_mib)));
    }
    if req.accelerator_num > 0.0 {
        limits.insert(
            ACCELERATOR_RESOURCE.to_string(),
            Quantity(req.accelerator_num.ceil().to_string()),
        );
    }

    ResourceRequirements {
        // Guaranteed QoS
        requests: Some(limits.clone()),
        limits: Some(limits),
        ..Default::default()
    }
}

fn container_env(deployment: &FleetDeployment) -> Vec<EnvVar> {
    let mut env = vec![EnvVar {
        name: "PHOTON_ID".to_string(),
        value: Some(deployment.spec.photon_id.clone()),
        ..Default::default()
    }];
    env.extend(deployment.spec.envs.iter().map(|e| EnvVar {
        name: e.name.clone(),
        value: Some(e.value.clone()),
        ..Default::default()
    }));
    env
}

/// Generate the workload for a deployment
pub fn generate_workload(deployment: &FleetDeployment) -> Deployment {
    let name = deployment.name_any();
    let spec = &deployment.spec;

    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();
    if has_volumes(deployment) {
        for (i, mount) in spec.mounts.iter().enumerate() {
            let volume = format!("mount-{i}");
            volumes.push(Volume {
                name: volume.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name(&name, i),
                    read_only: Some(false),
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: volume,
                mount_path: mount.mount_path.clone(),
                ..Default::default()
            });
        }
    }

    let container = Container {
        name: MAIN_CONTAINER.to_string(),
        image: Some(spec.image.clone()),
        env: Some(container_env(deployment)),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: spec.port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: spec.resources.as_ref().map(resource_requirements),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name(&name)),
            namespace: deployment.namespace(),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(deployment)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.min_replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(&name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn first_container(workload: &mut Deployment) -> Option<&mut Container> {
    workload
        .spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .first_mut()
}

/// Copy the owned fields of `desired` into `existing`: the replica count and
/// the first container's image, environment and ports.
///
/// Returns whether anything changed. A workload without containers is
/// replaced wholesale.
pub fn patch_workload(existing: &mut Deployment, desired: &Deployment) -> bool {
    let mut desired = desired.clone();
    let desired_replicas = desired.spec.as_ref().and_then(|s| s.replicas);
    let Some(want) = first_container(&mut desired).cloned() else {
        return false;
    };

    let mut changed = false;
    if let Some(spec) = existing.spec.as_mut()
        && spec.replicas != desired_replicas
    {
        spec.replicas = desired_replicas;
        changed = true;
    }

    match first_container(existing) {
        Some(have) => {
            if have.image != want.image {
                have.image = want.image;
                changed = true;
            }
            if have.env != want.env {
                have.env = want.env;
                changed = true;
            }
            if have.ports != want.ports {
                have.ports = want.ports;
                changed = true;
            }
        }
        None => {
            existing.spec = desired.spec;
            changed = true;
        }
    }
    changed
}

/// Replica counts reported by the workload's status
pub fn replica_counts(workload: &Deployment) -> ReplicaCounts {
    let status = workload.status.as_ref();
    ReplicaCounts {
        observed: status.and_then(|s| s.replicas).unwrap_or(0),
        ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
    }
}
