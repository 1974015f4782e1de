//! `namespace/name` keys carried by the work queue

use std::fmt;

use kube::core::DynamicObject;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Key of an object, `None` when it carries no name
    pub fn from_object(object: &DynamicObject) -> Option<Self> {
        let name = object.metadata.name.as_deref()?;
        Some(Self::new(object.metadata.namespace.as_deref(), name))
    }

    /// Split a `namespace/name` (or bare `name`) key
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(Error::InvalidKey(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}
