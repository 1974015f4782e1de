//! Store backed by the Kubernetes API server

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{
    Api, ListParams, Patch, PatchParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::core::{DynamicObject, TypeMeta};
use kube::Client;
use tracing::{debug, instrument};

use super::{
    describe, ObjectList, PatchBody, PatchOptions, Store, StoreError, StoreResult, WatchEvent,
    WatchStream,
};
use crate::registry::ResourceKind;

/// Server-side watch timeout; the stream ends and the cache re-watches.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if kind.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &kind.resource)
            }
            _ => Api::all_with(self.client.clone(), &kind.resource),
        }
    }
}

/// Map a kube client error onto the store's failure classes
pub(crate) fn classify(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code, &resp.reason, &resp.message, what),
        other => StoreError::Transient(format!("{what}: {other}")),
    }
}

pub(crate) fn classify_status(code: u16, reason: &str, message: &str, what: &str) -> StoreError {
    match code {
        404 => StoreError::NotFound(what.to_string()),
        409 if reason == "AlreadyExists" => StoreError::AlreadyExists(what.to_string()),
        409 => StoreError::Conflict(format!("{what}: {message}")),
        410 => StoreError::Expired(message.to_string()),
        400 | 401 | 403 | 422 => StoreError::Fatal(format!("{what}: {message}")),
        _ => StoreError::Transient(format!("{what}: {code} {message}")),
    }
}

/// List items usually come back without apiVersion/kind
fn with_types(mut object: DynamicObject, kind: &ResourceKind) -> DynamicObject {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: kind.api_version().to_string(),
            kind: kind.kind().to_string(),
        });
    }
    object
}

#[async_trait]
impl Store for KubeStore {
    #[instrument(skip(self), fields(kind = %kind.kind()))]
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        self.api(kind, namespace)
            .get(name)
            .await
            .map(|o| with_types(o, kind))
            .map_err(|e| classify(e, &describe(kind, namespace, name)))
    }

    #[instrument(skip(self), fields(kind = %kind.kind()))]
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<ObjectList> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, kind.kind()))?;

        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        debug!(count = list.items.len(), %resource_version, "listed");
        Ok(ObjectList {
            items: list.items.into_iter().map(|o| with_types(o, kind)).collect(),
            resource_version,
        })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> StoreResult<WatchStream> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self
            .api(kind, namespace)
            .watch(&wp, resource_version)
            .await
            .map_err(|e| classify(e, kind.kind()))?;

        let kind = kind.clone();
        Ok(stream
            .map(move |event| match event {
                Ok(KubeWatchEvent::Added(o)) => Ok(WatchEvent::Added(with_types(o, &kind))),
                Ok(KubeWatchEvent::Modified(o)) => Ok(WatchEvent::Modified(with_types(o, &kind))),
                Ok(KubeWatchEvent::Deleted(o)) => Ok(WatchEvent::Deleted(with_types(o, &kind))),
                Ok(KubeWatchEvent::Bookmark(b)) => {
                    Ok(WatchEvent::Bookmark(b.metadata.resource_version))
                }
                Ok(KubeWatchEvent::Error(resp)) => Err(classify_status(
                    resp.code,
                    &resp.reason,
                    &resp.message,
                    kind.kind(),
                )),
                Err(e) => Err(classify(e, kind.kind())),
            })
            .boxed())
    }

    #[instrument(skip(self, object), fields(kind = %kind.kind(), name = ?object.metadata.name))]
    async fn create(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let namespace = object.metadata.namespace.as_deref();
        let name = object.metadata.name.clone().unwrap_or_default();
        self.api(kind, namespace)
            .create(&PostParams::default(), object)
            .await
            .map(|o| with_types(o, kind))
            .map_err(|e| classify(e, &describe(kind, namespace, &name)))
    }

    #[instrument(skip(self, patch), fields(kind = %kind.kind()))]
    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &PatchBody,
        options: &PatchOptions,
    ) -> StoreResult<DynamicObject> {
        let mut params = PatchParams::default();
        params.field_manager = options.field_manager.clone();
        params.dry_run = options.dry_run;

        self.api(kind, namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await
            .map(|o| with_types(o, kind))
            .map_err(|e| classify(e, &describe(kind, namespace, name)))
    }
}
