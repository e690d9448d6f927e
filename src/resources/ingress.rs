//! Ingress rules exposing a deployment
//!
//! Every deployment gets a header-based ingress on the workspace's shared load
//! balancer, selected by the `X-Fleet-Deployment` header. With a root domain a
//! host-based ingress for `<name>-<workspace>.<root domain>` is added.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde_json::json;

use crate::crd::FleetDeployment;
use crate::resources::common::{owner_reference, standard_labels};
use crate::resources::service::service_name;

/// Annotations under this prefix belong to the operator
pub const OWNED_ANNOTATION_PREFIX: &str = "alb.ingress.kubernetes.io/";

pub const DEPLOYMENT_HEADER: &str = "X-Fleet-Deployment";

const INGRESS_CLASS: &str = "alb";

/// Fleet-wide values used when a deployment does not set its own
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngressSettings {
    pub root_domain: Option<String>,
    pub certificate_arn: Option<String>,
}

impl IngressSettings {
    fn root_domain<'a>(&'a self, deployment: &'a FleetDeployment) -> Option<&'a str> {
        deployment
            .spec
            .root_domain
            .as_deref()
            .or(self.root_domain.as_deref())
            .filter(|d| !d.is_empty())
    }

    fn certificate_arn<'a>(&'a self, deployment: &'a FleetDeployment) -> Option<&'a str> {
        deployment
            .spec
            .certificate_arn
            .as_deref()
            .or(self.certificate_arn.as_deref())
            .filter(|c| !c.is_empty())
    }

    /// Public host of a deployment, if it has one
    pub fn host(&self, deployment: &FleetDeployment) -> Option<String> {
        self.root_domain(deployment).map(|domain| {
            format!(
                "{}-{}.{}",
                deployment.name_any(),
                deployment.spec.workspace_name,
                domain
            )
        })
    }
}

pub fn header_ingress_name(deployment_name: &str) -> String {
    format!("{deployment_name}-header-ingress")
}

pub fn host_ingress_name(deployment_name: &str) -> String {
    format!("{deployment_name}-host-ingress")
}

fn http_rule(deployment: &FleetDeployment, host: Option<String>) -> IngressRule {
    IngressRule {
        host,
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service_name(&deployment.name_any()),
                        port: Some(ServiceBackendPort {
                            number: Some(deployment.spec.port),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }
}

fn base_annotations(
    deployment: &FleetDeployment,
    settings: &IngressSettings,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (
            format!("{OWNED_ANNOTATION_PREFIX}group.name"),
            deployment.spec.workspace_name.clone(),
        ),
        (
            format!("{OWNED_ANNOTATION_PREFIX}scheme"),
            "internet-facing".to_string(),
        ),
        (
            format!("{OWNED_ANNOTATION_PREFIX}target-type"),
            "ip".to_string(),
        ),
    ]);
    match settings.certificate_arn(deployment) {
        Some(arn) => {
            annotations.insert(format!("{OWNED_ANNOTATION_PREFIX}certificate-arn"), arn.to_string());
            annotations.insert(
                format!("{OWNED_ANNOTATION_PREFIX}listen-ports"),
                r#"[{"HTTPS":443}]"#.to_string(),
            );
        }
        None => {
            annotations.insert(
                format!("{OWNED_ANNOTATION_PREFIX}listen-ports"),
                r#"[{"HTTP":80}]"#.to_string(),
            );
        }
    }
    annotations
}

fn ingress(
    deployment: &FleetDeployment,
    name: String,
    annotations: BTreeMap<String, String>,
    rule: IngressRule,
) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: deployment.namespace(),
            labels: Some(standard_labels(&deployment.name_any())),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(deployment)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            rules: Some(vec![rule]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the desired ingresses for a deployment
pub fn generate_ingresses(deployment: &FleetDeployment, settings: &IngressSettings) -> Vec<Ingress> {
    let name = deployment.name_any();
    let mut ingresses = Vec::with_capacity(2);

    let mut annotations = base_annotations(deployment, settings);
    let condition = json!([{
        "field": "http-header",
        "httpHeaderConfig": {
            "httpHeaderName": DEPLOYMENT_HEADER,
            "values": [name],
        }
    }]);
    annotations.insert(
        format!("{OWNED_ANNOTATION_PREFIX}conditions.{}", service_name(&name)),
        condition.to_string(),
    );
    ingresses.push(ingress(
        deployment,
        header_ingress_name(&name),
        annotations,
        http_rule(deployment, None),
    ));

    if let Some(host) = settings.host(deployment) {
        ingresses.push(ingress(
            deployment,
            host_ingress_name(&name),
            base_annotations(deployment, settings),
            http_rule(deployment, Some(host)),
        ));
    }

    ingresses
}

/// Copy the owned fields of `desired` into `existing`: the rules and the
/// annotations under [`OWNED_ANNOTATION_PREFIX`]. Other annotations are kept.
///
/// Returns whether anything changed.
pub fn patch_ingress(existing: &mut Ingress, desired: &Ingress) -> bool {
    let mut changed = false;

    let desired_annotations = desired.metadata.annotations.clone().unwrap_or_default();
    let annotations = existing.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let before = annotations.len();
    annotations.retain(|k, _| {
        !k.starts_with(OWNED_ANNOTATION_PREFIX) || desired_annotations.contains_key(k)
    });
    changed |= annotations.len() != before;
    for (k, v) in desired_annotations {
        if annotations.get(&k) != Some(&v) {
            annotations.insert(k, v);
            changed = true;
        }
    }

    let desired_rules = desired.spec.as_ref().and_then(|s| s.rules.clone());
    let spec = existing.spec.get_or_insert_with(IngressSpec::default);
    if spec.rules != desired_rules {
        spec.rules = desired_rules;
        changed = true;
    }

    changed
}
