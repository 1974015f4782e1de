//! Shared types for the App CRD

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single dependent resource declared by an App.
///
/// The `kind` tag selects the resource type; the remaining fields are
/// the kind-specific parameters used to build it.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum DependentSpec {
    Deployment(DeploymentDependent),
    Service(ServiceDependent),
    Ingress(IngressDependent),
}

impl DependentSpec {
    /// Name of the dependent resource in the App's namespace
    pub fn name(&self) -> &str {
        match self {
            DependentSpec::Deployment(d) => &d.name,
            DependentSpec::Service(s) => &s.name,
            DependentSpec::Ingress(i) => &i.name,
        }
    }

    /// Kind identifier as registered in the kind registry
    pub fn kind(&self) -> &'static str {
        match self {
            DependentSpec::Deployment(_) => "Deployment",
            DependentSpec::Service(_) => "Service",
            DependentSpec::Ingress(_) => "Ingress",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDependent {
    pub name: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container image reference, e.g. `nginx:latest`
    pub image: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDependent {
    pub name: String,

    #[serde(default = "default_port")]
    pub port: i32,

    /// Defaults to `port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,

    /// Pod selector; defaults to every pod labelled with the owning App
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
}

impl ServiceDependent {
    pub fn effective_target_port(&self) -> i32 {
        self.target_port.unwrap_or(self.port)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngressDependent {
    pub name: String,

    /// Backend Service receiving the traffic
    pub service_name: String,

    #[serde(default = "default_port")]
    pub service_port: i32,

    #[serde(default = "default_path")]
    pub path: String,
}

fn default_replicas() -> i32 {
    1
}

fn default_port() -> i32 {
    80
}

fn default_path() -> String {
    "/".to_string()
}

/// Standard Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready")
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False", or "Unknown"
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
