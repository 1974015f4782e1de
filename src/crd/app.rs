//! App Custom Resource Definition
//!
//! An App declares an ordered list of dependent resources (Deployments,
//! Services, Ingresses) that the controller creates and keeps owned.

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, DependentSpec};

/// Structured validation error for `AppSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "groupkind.io",
    version = "v1alpha1",
    kind = "App",
    namespaced,
    status = "AppStatus",
    shortname = "app",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Dependent resources, reconciled in declaration order
    #[serde(default)]
    pub dependents: Vec<DependentSpec>,
}

impl AppSpec {
    /// Validate the declared dependents.
    ///
    /// All problems are collected so an operator sees them in one event.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (idx, dep) in self.dependents.iter().enumerate() {
            let field = format!("spec.dependents[{idx}]");

            if !is_dns1123_subdomain(dep.name()) {
                errors.push(SpecValidationError::new(
                    format!("{field}.name"),
                    format!("{:?} is not a valid DNS-1123 subdomain", dep.name()),
                ));
            }

            if !seen.insert((dep.kind(), dep.name())) {
                errors.push(SpecValidationError::new(
                    format!("{field}.name"),
                    format!("duplicate {} named {:?}", dep.kind(), dep.name()),
                ));
            }

            match dep {
                DependentSpec::Deployment(d) => {
                    if d.replicas < 0 {
                        errors.push(SpecValidationError::new(
                            format!("{field}.replicas"),
                            "replicas must not be negative",
                        ));
                    }
                    if d.image.trim().is_empty() {
                        errors.push(SpecValidationError::new(
                            format!("{field}.image"),
                            "image must not be empty",
                        ));
                    }
                }
                DependentSpec::Service(s) => {
                    validate_port(&format!("{field}.port"), s.port, &mut errors);
                    if let Some(target) = s.target_port {
                        validate_port(&format!("{field}.targetPort"), target, &mut errors);
                    }
                }
                DependentSpec::Ingress(i) => {
                    if !is_dns1123_subdomain(&i.service_name) {
                        errors.push(SpecValidationError::new(
                            format!("{field}.serviceName"),
                            format!("{:?} is not a valid service name", i.service_name),
                        ));
                    }
                    validate_port(&format!("{field}.servicePort"), i.service_port, &mut errors);
                    if !i.path.starts_with('/') {
                        errors.push(SpecValidationError::new(
                            format!("{field}.path"),
                            "path must start with '/'",
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_port(field: &str, port: i32, errors: &mut Vec<SpecValidationError>) {
    if !(1..=65535).contains(&port) {
        errors.push(SpecValidationError::new(
            field,
            format!("port {port} is outside 1-65535"),
        ));
    }
}

/// RFC 1123 subdomain: lowercase alphanumerics, '-' and '.', starting and
/// ending with an alphanumeric, at most 253 characters.
pub fn is_dns1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-' || b == b'.')
}

/// Observed state of an App
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
