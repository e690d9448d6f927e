//! Service routing traffic to a deployment's pods

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::FleetDeployment;
use crate::resources::common::{owner_reference, selector_labels, standard_labels};

pub fn service_name(deployment_name: &str) -> String {
    format!("{deployment_name}-service")
}

/// Generate the route Service for a deployment
pub fn generate_service(deployment: &FleetDeployment) -> Service {
    let name = deployment.name_any();

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&name)),
            namespace: deployment.namespace(),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(deployment)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: deployment.spec.port,
                target_port: Some(IntOrString::Int(deployment.spec.port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Copy the owned fields (selector and ports) of `desired` into `existing`.
///
/// Returns whether anything changed. Fields the API server fills in, such as
/// the cluster IP, are left alone.
pub fn patch_service(existing: &mut Service, desired: &Service) -> bool {
    let desired_spec = desired.spec.clone().unwrap_or_default();
    let spec = existing.spec.get_or_insert_with(ServiceSpec::default);

    let mut changed = false;
    if spec.selector != desired_spec.selector {
        spec.selector = desired_spec.selector;
        changed = true;
    }
    if spec.ports != desired_spec.ports {
        spec.ports = desired_spec.ports;
        changed = true;
    }
    changed
}
