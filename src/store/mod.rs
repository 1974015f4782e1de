//! Cluster state store
//!
//! The [`Store`] trait is the only path by which the controller talks to
//! the source of truth. [`KubeStore`] backs it with the Kubernetes API,
//! [`InMemoryStore`] with an in-process map that behaves the same way
//! (resource versions, watch replay, conflicts) for tests and local runs.

mod kube_store;
mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::DynamicObject;
use thiserror::Error;

use crate::registry::ResourceKind;

pub use kube_store::KubeStore;
pub use memory::{InMemoryStore, StoreOp};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure classes reported by a [`Store`].
///
/// The engine handles `NotFound` explicitly, drops keys on `Fatal` and
/// retries everything else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested resource version is no longer available; re-list.
    #[error("resource version expired: {0}")]
    Expired(String),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal(_))
    }
}

/// A change observed on a watch stream
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    /// Progress marker carrying only a resource version
    Bookmark(String),
}

impl WatchEvent {
    pub fn object(&self) -> Option<&DynamicObject> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Bookmark(_) => None,
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Bookmark(rv) => Some(rv),
            _ => self
                .object()
                .and_then(|o| o.metadata.resource_version.as_deref()),
        }
    }
}

/// Result of a list call
#[derive(Clone, Debug, Default)]
pub struct ObjectList {
    pub items: Vec<DynamicObject>,
    /// Version to resume a watch from
    pub resource_version: String,
}

/// JSON merge patch body
pub type PatchBody = serde_json::Value;

#[derive(Clone, Debug, Default)]
pub struct PatchOptions {
    pub field_manager: Option<String>,
    pub dry_run: bool,
}

pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject>;

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<ObjectList>;

    /// Stream changes that happened after `resource_version`.
    ///
    /// The stream ends when the server closes it; callers re-list and
    /// watch again.
    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> StoreResult<WatchStream>;

    async fn create(&self, kind: &ResourceKind, object: &DynamicObject)
        -> StoreResult<DynamicObject>;

    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &PatchBody,
        options: &PatchOptions,
    ) -> StoreResult<DynamicObject>;
}

/// Human-readable identity used in store error messages
pub(crate) fn describe(kind: &ResourceKind, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", kind.kind(), ns, name),
        None => format!("{} {}", kind.kind(), name),
    }
}
