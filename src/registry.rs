//! Kind registry
//!
//! Maps a kind name to its API coordinates and an optional validator.
//! The registry is built once at startup and handed to the store, the
//! caches and the reconcile engine; nothing mutates it afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::{ApiResource, DynamicObject};

use crate::crd::App;
use crate::error::{Error, Result};

/// API coordinates of a watched resource kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl ResourceKind {
    /// Coordinates for a typed kube resource
    pub fn of<K>(namespaced: bool) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self {
            resource: ApiResource::erase::<K>(&()),
            namespaced,
        }
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    pub fn group(&self) -> &str {
        &self.resource.group
    }

    pub fn api_version(&self) -> &str {
        &self.resource.api_version
    }

    pub fn plural(&self) -> &str {
        &self.resource.plural
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource.kind, self.resource.api_version)
    }
}

/// Validation hook run before an object of this kind is persisted
pub type Validator = Arc<dyn Fn(&DynamicObject) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredKind {
    pub kind: ResourceKind,
    pub validator: Option<Validator>,
}

impl fmt::Debug for RegisteredKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredKind")
            .field("kind", &self.kind)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, RegisteredKind>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the App kind and the dependent kinds it can declare
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_with_validator(ResourceKind::of::<App>(true), Arc::new(validate_app));
        registry.register(ResourceKind::of::<Deployment>(true));
        registry.register(ResourceKind::of::<Service>(true));
        registry.register(ResourceKind::of::<Ingress>(true));
        registry
    }

    pub fn register(&mut self, kind: ResourceKind) {
        self.kinds.insert(
            kind.kind().to_string(),
            RegisteredKind {
                kind,
                validator: None,
            },
        );
    }

    pub fn register_with_validator(&mut self, kind: ResourceKind, validator: Validator) {
        self.kinds.insert(
            kind.kind().to_string(),
            RegisteredKind {
                kind,
                validator: Some(validator),
            },
        );
    }

    pub fn get(&self, kind: &str) -> Option<&ResourceKind> {
        self.kinds.get(kind).map(|r| &r.kind)
    }

    /// Like [`get`](Self::get) but unknown kinds are an error
    pub fn resolve(&self, kind: &str) -> Result<&ResourceKind> {
        self.get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    /// Run the kind's validator, if any, against `object`
    pub fn validate(&self, kind: &str, object: &DynamicObject) -> Result<()> {
        let registered = self
            .kinds
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        match &registered.validator {
            Some(validate) => validate(object).map_err(Error::ValidationError),
            None => Ok(()),
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.kinds.values().map(|r| &r.kind)
    }
}

fn validate_app(object: &DynamicObject) -> std::result::Result<(), String> {
    let app = crate::controller::resources::parse_app(object).map_err(|e| e.to_string())?;
    app.spec.validate().map_err(|errors| {
        errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    })
}
