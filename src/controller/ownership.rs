//! Controller ownership checks
//!
//! A dependent belongs to a primary resource when its controlling owner
//! reference names that exact instance: same kind and API group, same
//! name and uid, and the dependent lives in the owner's namespace.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::DynamicObject;

use crate::registry::ResourceKind;

/// Identity of a would-be owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
}

impl OwnerIdentity {
    /// `None` when the object has not been persisted (no name or uid)
    pub fn of(object: &DynamicObject, kind: &ResourceKind) -> Option<Self> {
        Some(Self {
            api_version: kind.api_version().to_string(),
            kind: kind.kind().to_string(),
            namespace: object.metadata.namespace.clone(),
            name: object.metadata.name.clone()?,
            uid: object.metadata.uid.clone()?,
        })
    }

    /// Controlling owner reference pointing at this identity
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// The owner reference flagged `controller: true`, if any
pub fn controller_ref(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Group part of an `apiVersion` (`apps/v1` -> `apps`, `v1` -> ``)
pub(crate) fn api_group(api_version: &str) -> &str {
    api_version
        .rsplit_once('/')
        .map(|(group, _)| group)
        .unwrap_or("")
}

/// Whether `meta` is controlled by `owner`
pub fn is_owned_by(meta: &ObjectMeta, owner: &OwnerIdentity) -> bool {
    let Some(reference) = controller_ref(meta) else {
        return false;
    };
    reference.uid == owner.uid
        && reference.name == owner.name
        && reference.kind == owner.kind
        && api_group(&reference.api_version) == api_group(&owner.api_version)
        && meta.namespace == owner.namespace
}
