//! Desired dependents of an App
//!
//! Builds the typed Deployments, Services and Ingresses an App declares
//! and converts them to [`DynamicObject`]s, so the engine stays generic
//! over kinds. Each desired object carries the fragment of fields the
//! controller keeps in sync; drift is detected against that fragment
//! only, leaving server-defaulted fields alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::{json, Value};

use crate::controller::ownership::OwnerIdentity;
use crate::crd::{App, DependentSpec, DeploymentDependent, IngressDependent, ServiceDependent};
use crate::error::{Error, Result};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "groupkind-controller";
pub const CONTROLLER_LABEL: &str = "controller";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";

/// A dependent the primary resource asks for
#[derive(Clone, Debug)]
pub struct DesiredObject {
    /// Registered kind name
    pub kind: String,
    pub name: String,
    /// Complete object to create when absent
    pub object: DynamicObject,
    /// Fields kept in sync on an existing dependent, as a merge patch
    pub managed: Value,
}

/// Computes the dependents of a primary resource
pub trait DesiredState: Send + Sync {
    /// Kind of the primary resource
    fn primary_kind(&self) -> &str;

    /// Kinds the dependents may have
    fn dependent_kinds(&self) -> Vec<String>;

    /// Dependents of `primary`, in declaration order.
    ///
    /// An error means the primary itself is unusable until edited.
    fn desired(&self, primary: &DynamicObject, owner: &OwnerIdentity) -> Result<Vec<DesiredObject>>;
}

/// Decode an App from its dynamic form
pub fn parse_app(object: &DynamicObject) -> Result<App> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Labels put on every dependent of `app_name`
pub fn standard_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (CONTROLLER_LABEL.to_string(), app_name.to_string()),
    ])
}

fn pod_labels(app_name: &str, dependent: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), dependent.to_string()),
        (CONTROLLER_LABEL.to_string(), app_name.to_string()),
    ])
}

fn dependent_meta(name: &str, owner: &OwnerIdentity) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.namespace.clone(),
        labels: Some(standard_labels(&owner.name)),
        owner_references: Some(vec![owner.controller_ref()]),
        ..Default::default()
    }
}

pub fn build_deployment(dep: &DeploymentDependent, owner: &OwnerIdentity) -> Deployment {
    let labels = pod_labels(&owner.name, &dep.name);

    Deployment {
        metadata: dependent_meta(&dep.name, owner),
        spec: Some(DeploymentSpec {
            replicas: Some(dep.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: dep.name.clone(),
                        image: Some(dep.image.clone()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn build_service(svc: &ServiceDependent, owner: &OwnerIdentity) -> Service {
    let selector = svc
        .selector
        .clone()
        .unwrap_or_else(|| BTreeMap::from([(CONTROLLER_LABEL.to_string(), owner.name.clone())]));

    Service {
        metadata: dependent_meta(&svc.name, owner),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: svc.port,
                target_port: Some(IntOrString::Int(svc.effective_target_port())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn build_ingress(ing: &IngressDependent, owner: &OwnerIdentity) -> Ingress {
    Ingress {
        metadata: dependent_meta(&ing.name, owner),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(ing.path.clone()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: ing.service_name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(ing.service_port),
                                    name: None,
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

fn managed_fields(spec: &DependentSpec, owner: &OwnerIdentity) -> Value {
    let labels = standard_labels(&owner.name);
    let spec_fragment = match spec {
        DependentSpec::Deployment(d) => json!({
            "replicas": d.replicas,
            "template": { "spec": { "containers": [{ "name": d.name, "image": d.image }] } },
        }),
        DependentSpec::Service(s) => json!({
            "ports": [{
                "name": "http",
                "port": s.port,
                "targetPort": s.effective_target_port(),
                "protocol": "TCP",
            }],
        }),
        DependentSpec::Ingress(i) => json!({
            "rules": [{ "http": { "paths": [{
                "path": i.path,
                "pathType": "Prefix",
                "backend": { "service": { "name": i.service_name, "port": { "number": i.service_port } } },
            }] } }],
        }),
    };
    json!({ "metadata": { "labels": labels }, "spec": spec_fragment })
}

fn to_dynamic<K: Serialize>(typed: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(typed)?)?)
}

/// Whether every field of `want` is present with the same value in `have`.
///
/// Arrays must have the same length and match element-wise.
pub fn is_subset(want: &Value, have: &Value) -> bool {
    match (want, have) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (want, have) => want == have,
    }
}

/// Whether `object` already carries the fields in `managed`
pub fn is_converged(object: &DynamicObject, managed: &Value) -> Result<bool> {
    Ok(is_subset(managed, &serde_json::to_value(object)?))
}

/// Desired state for the App kind
#[derive(Clone, Copy, Debug, Default)]
pub struct AppDesiredState;

impl DesiredState for AppDesiredState {
    fn primary_kind(&self) -> &str {
        "App"
    }

    fn dependent_kinds(&self) -> Vec<String> {
        vec!["Deployment".into(), "Service".into(), "Ingress".into()]
    }

    fn desired(
        &self,
        primary: &DynamicObject,
        owner: &OwnerIdentity,
    ) -> Result<Vec<DesiredObject>> {
        let app = parse_app(primary)?;
        app.spec.validate().map_err(|errors| {
            Error::ValidationError(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        app.spec
            .dependents
            .iter()
            .map(|spec| {
                let object = match spec {
                    DependentSpec::Deployment(d) => to_dynamic(&build_deployment(d, owner))?,
                    DependentSpec::Service(s) => to_dynamic(&build_service(s, owner))?,
                    DependentSpec::Ingress(i) => to_dynamic(&build_ingress(i, owner))?,
                };
                Ok(DesiredObject {
                    kind: spec.kind().to_string(),
                    name: spec.name().to_string(),
                    object,
                    managed: managed_fields(spec, owner),
                })
            })
            .collect()
    }
}
