//! In-process store with Kubernetes-like semantics
//!
//! Every write bumps a global revision that becomes the object's
//! resource version. Writes are appended to a bounded history so a
//! watch started from a listed version replays what it missed; a
//! version older than the retained history is answered with
//! [`StoreError::Expired`], which makes the cache re-list.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, TypeMeta};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::{
    describe, ObjectList, PatchBody, PatchOptions, Store, StoreError, StoreResult, WatchEvent,
    WatchStream,
};
use crate::registry::{KindRegistry, ResourceKind};

const HISTORY_LIMIT: usize = 1024;
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// (kind, namespace or "", name)
type ObjectId = (String, String, String);

/// Store operations that can be made to fail on purpose
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    List,
    Watch,
    Create,
    Patch,
}

#[derive(Clone, Debug)]
struct Recorded {
    revision: u64,
    kind: String,
    namespace: String,
    event: WatchEvent,
}

struct Inner {
    objects: BTreeMap<ObjectId, DynamicObject>,
    revision: u64,
    history: VecDeque<Recorded>,
    /// Highest revision dropped from `history`
    compacted: u64,
    watchers: broadcast::Sender<Recorded>,
    faults: VecDeque<(StoreOp, StoreError)>,
}

impl Inner {
    fn take_fault(&mut self, op: StoreOp) -> StoreResult<()> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Stamp the next revision on `object` and publish the change
    fn commit(
        &mut self,
        kind: &str,
        event: fn(DynamicObject) -> WatchEvent,
        mut object: DynamicObject,
    ) -> DynamicObject {
        self.revision += 1;
        object.metadata.resource_version = Some(self.revision.to_string());

        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let recorded = Recorded {
            revision: self.revision,
            kind: kind.to_string(),
            namespace: namespace.clone(),
            event: event(object.clone()),
        };

        if matches!(recorded.event, WatchEvent::Deleted(_)) {
            self.objects.remove(&(kind.to_string(), namespace, name));
        } else {
            self.objects
                .insert((kind.to_string(), namespace, name), object.clone());
        }

        self.history.push_back(recorded.clone());
        if self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
        // no receivers is fine
        let _ = self.watchers.send(recorded);
        object
    }
}

pub struct InMemoryStore {
    registry: Arc<KindRegistry>,
    inner: Mutex<Inner>,
    creates: AtomicUsize,
    patches: AtomicUsize,
}

impl InMemoryStore {
    pub fn new(registry: Arc<KindRegistry>) -> Self {
        let (watchers, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            registry,
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                compacted: 0,
                watchers,
                faults: VecDeque::new(),
            }),
            creates: AtomicUsize::new(0),
            patches: AtomicUsize::new(0),
        }
    }

    /// Number of successful `create` calls made through the [`Store`] trait
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful `patch` calls made through the [`Store`] trait
    pub fn patch_count(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.create_count() + self.patch_count()
    }

    /// Make the next call of `op` fail with `err`
    pub async fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.inner.lock().await.faults.push_back((op, err));
    }

    /// End every open watch stream, as a dropped connection would
    pub async fn disconnect_watchers(&self) {
        let (watchers, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        self.inner.lock().await.watchers = watchers;
    }

    /// Create or replace an object on behalf of an external actor.
    ///
    /// Not counted as a controller write.
    pub async fn upsert(&self, kind: &ResourceKind, mut object: DynamicObject) -> DynamicObject {
        let mut inner = self.inner.lock().await;
        let id = object_id(kind, &object);
        let existing = inner.objects.get(&id).cloned();

        object.types = Some(type_meta(kind));
        match existing {
            Some(old) => {
                object.metadata.uid = old.metadata.uid;
                object.metadata.creation_timestamp = old.metadata.creation_timestamp;
                object.metadata.generation = Some(old.metadata.generation.unwrap_or(1) + 1);
                inner.commit(kind.kind(), WatchEvent::Modified, object)
            }
            None => {
                stamp_new(&mut object);
                inner.commit(kind.kind(), WatchEvent::Added, object)
            }
        }
    }

    /// Delete an object on behalf of an external actor
    pub async fn remove(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let mut inner = self.inner.lock().await;
        let id = (
            kind.kind().to_string(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        );
        let existing = inner.objects.get(&id).cloned()?;
        Some(inner.commit(kind.kind(), WatchEvent::Deleted, existing))
    }

    /// Current objects of `kind`, in name order
    pub async fn objects(&self, kind: &ResourceKind) -> Vec<DynamicObject> {
        let inner = self.inner.lock().await;
        inner
            .objects
            .iter()
            .filter(|((k, _, _), _)| k == kind.kind())
            .map(|(_, o)| o.clone())
            .collect()
    }
}

fn object_id(kind: &ResourceKind, object: &DynamicObject) -> ObjectId {
    (
        kind.kind().to_string(),
        object.metadata.namespace.clone().unwrap_or_default(),
        object.metadata.name.clone().unwrap_or_default(),
    )
}

fn type_meta(kind: &ResourceKind) -> TypeMeta {
    TypeMeta {
        api_version: kind.api_version().to_string(),
        kind: kind.kind().to_string(),
    }
}

fn stamp_new(object: &mut DynamicObject) {
    if object.metadata.uid.is_none() {
        object.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    object.metadata.creation_timestamp = Some(Time(Utc::now()));
    object.metadata.generation = Some(1);
}

fn parse_revision(resource_version: &str) -> StoreResult<Option<u64>> {
    match resource_version {
        "" | "0" => Ok(None),
        rv => rv
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Fatal(format!("invalid resource version {rv:?}"))),
    }
}

/// RFC 7386 JSON merge patch
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in fields {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<DynamicObject> {
        let mut inner = self.inner.lock().await;
        inner.take_fault(StoreOp::Get)?;
        let id = (
            kind.kind().to_string(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        );
        inner
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(describe(kind, namespace, name)))
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> StoreResult<ObjectList> {
        let mut inner = self.inner.lock().await;
        inner.take_fault(StoreOp::List)?;
        let items = inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind.kind() && namespace.map_or(true, |want| want == ns))
            .map(|(_, o)| o.clone())
            .collect();
        Ok(ObjectList {
            items,
            resource_version: inner.revision.to_string(),
        })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> StoreResult<WatchStream> {
        let mut inner = self.inner.lock().await;
        inner.take_fault(StoreOp::Watch)?;

        let since = parse_revision(resource_version)?.unwrap_or(inner.revision);
        if since < inner.compacted {
            return Err(StoreError::Expired(format!(
                "resource version {since} is older than {}",
                inner.compacted
            )));
        }

        let kind_name = kind.kind().to_string();
        let namespace = namespace.map(str::to_string);
        let wanted = move |r: &Recorded| {
            r.revision > since
                && r.kind == kind_name
                && namespace.as_deref().map_or(true, |ns| ns == r.namespace)
        };

        let backlog: Vec<StoreResult<WatchEvent>> = inner
            .history
            .iter()
            .filter(|r| wanted(r))
            .map(|r| Ok(r.event.clone()))
            .collect();
        // Subscribing under the lock means no write can fall between
        // the backlog and the live feed.
        let rx = inner.watchers.subscribe();
        drop(inner);

        debug!(kind = %kind.kind(), since, backlog = backlog.len(), "watch opened");

        let live = stream::unfold(Some(rx), move |state| {
            let wanted = wanted.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Ok(r) if wanted(&r) => return Some((Ok(r.event), Some(rx))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((
                                Err(StoreError::Expired(format!("watcher lagged by {n} events"))),
                                None,
                            ))
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(backlog).chain(live).boxed())
    }

    async fn create(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let mut inner = self.inner.lock().await;
        inner.take_fault(StoreOp::Create)?;

        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::Fatal(format!("{} without a name", kind.kind())))?;
        let namespace = object.metadata.namespace.as_deref();
        if kind.namespaced && namespace.is_none() {
            return Err(StoreError::Fatal(format!(
                "{} {name} requires a namespace",
                kind.kind()
            )));
        }
        self.registry
            .validate(kind.kind(), object)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;

        let id = object_id(kind, object);
        if inner.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists(describe(kind, namespace, &name)));
        }

        let mut object = object.clone();
        object.types = Some(type_meta(kind));
        object.metadata.uid = None;
        stamp_new(&mut object);
        let created = inner.commit(kind.kind(), WatchEvent::Added, object);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &PatchBody,
        options: &PatchOptions,
    ) -> StoreResult<DynamicObject> {
        let mut inner = self.inner.lock().await;
        inner.take_fault(StoreOp::Patch)?;

        let id = (
            kind.kind().to_string(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        );
        let current = inner
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(describe(kind, namespace, name)))?;

        if let Some(expected) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "{}: the object has been modified",
                    describe(kind, namespace, name)
                )));
            }
        }

        let mut merged = serde_json::to_value(&current)
            .map_err(|e| StoreError::Fatal(format!("encoding {name}: {e}")))?;
        merge_patch(&mut merged, patch);
        let mut patched: DynamicObject = serde_json::from_value(merged)
            .map_err(|e| StoreError::Fatal(format!("patched {name} is invalid: {e}")))?;

        // identity is immutable
        patched.metadata.name = current.metadata.name.clone();
        patched.metadata.namespace = current.metadata.namespace.clone();
        patched.metadata.uid = current.metadata.uid.clone();
        patched.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        patched.types = Some(type_meta(kind));
        if patched.data.get("spec") != current.data.get("spec") {
            patched.metadata.generation = Some(current.metadata.generation.unwrap_or(1) + 1);
        }

        if options.dry_run {
            return Ok(patched);
        }

        let patched = inner.commit(kind.kind(), WatchEvent::Modified, patched);
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn registry() -> Arc<KindRegistry> {
        Arc::new(KindRegistry::builtin())
    }

    fn deployment(name: &str) -> (ResourceKind, DynamicObject) {
        let kind = registry().resolve("Deployment").unwrap().clone();
        let mut obj = DynamicObject::new(name, &kind.resource).within("default");
        obj.data = serde_json::json!({ "spec": { "replicas": 1 } });
        (kind, obj)
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut target = serde_json::json!({ "a": "b", "c": { "d": "e", "f": "g" } });
        merge_patch(
            &mut target,
            &serde_json::json!({ "a": "z", "c": { "f": null, "h": [1] } }),
        );
        assert_eq!(
            target,
            serde_json::json!({ "a": "z", "c": { "d": "e", "h": [1] } })
        );
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = InMemoryStore::new(registry());
        let (kind, obj) = deployment("web");

        let created = store.create(&kind, &obj).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(store.create_count(), 1);

        let err = store.create(&kind, &obj).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn patch_checks_resource_version() {
        let store = InMemoryStore::new(registry());
        let (kind, obj) = deployment("web");
        store.create(&kind, &obj).await.unwrap();

        let stale = serde_json::json!({ "metadata": { "resourceVersion": "0" }, "spec": { "replicas": 3 } });
        let err = store
            .patch(&kind, Some("default"), "web", &stale, &PatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let patch = serde_json::json!({ "spec": { "replicas": 3 } });
        let patched = store
            .patch(&kind, Some("default"), "web", &patch, &PatchOptions::default())
            .await
            .unwrap();
        assert_eq!(patched.data["spec"]["replicas"], 3);
        assert_eq!(patched.metadata.generation, Some(2));
        assert_eq!(store.patch_count(), 1);
    }

    #[tokio::test]
    async fn watch_replays_changes_after_listed_version() {
        let store = InMemoryStore::new(registry());
        let (kind, obj) = deployment("a");
        store.create(&kind, &obj).await.unwrap();
        let listed = store.list(&kind, None).await.unwrap();
        assert_eq!(listed.items.len(), 1);

        let (_, b) = deployment("b");
        store.create(&kind, &b).await.unwrap();
        store.remove(&kind, Some("default"), "a").await.unwrap();

        let mut events = store
            .watch(&kind, None, &listed.resource_version)
            .await
            .unwrap();
        match events.next().await {
            Some(Ok(WatchEvent::Added(o))) => assert_eq!(o.metadata.name.as_deref(), Some("b")),
            other => panic!("unexpected {other:?}"),
        }
        match events.next().await {
            Some(Ok(WatchEvent::Deleted(o))) => assert_eq!(o.metadata.name.as_deref(), Some("a")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_ends_open_watches() {
        let store = InMemoryStore::new(registry());
        let (kind, _) = deployment("a");
        let mut events = store.watch(&kind, None, "").await.unwrap();

        store.disconnect_watchers().await;
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let store = InMemoryStore::new(registry());
        let (kind, _) = deployment("a");
        store
            .fail_next(StoreOp::List, StoreError::Transient("boom".into()))
            .await;

        assert!(store.list(&kind, None).await.is_err());
        assert!(store.list(&kind, None).await.is_ok());
    }
}
