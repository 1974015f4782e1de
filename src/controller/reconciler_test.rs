//! Tests for the reconcile engine
//!
//! Every test runs the engine against an [`InMemoryStore`] with live
//! caches in front of it:
//! - absent and deleting primaries
//! - creation and idempotence
//! - ownership conflicts
//! - store failures and drift correction

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use kube::core::DynamicObject;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::super::cache::{KeyMapper, ResourceCache};
    use super::super::events::{
        InMemoryEventRecorder, REASON_CREATE_FAILED, REASON_INVALID_SPEC,
        REASON_RESOURCE_EXISTS, REASON_SYNCED,
    };
    use super::super::reconciler::*;
    use super::super::resources::AppDesiredState;
    use crate::registry::{KindRegistry, ResourceKind};
    use crate::store::{InMemoryStore, Store, StoreError, StoreOp};

    struct Harness {
        registry: Arc<KindRegistry>,
        store: Arc<InMemoryStore>,
        caches: Vec<Arc<ResourceCache>>,
        recorder: Arc<InMemoryEventRecorder>,
        engine: ReconcileEngine,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn start() -> Self {
            let registry = Arc::new(KindRegistry::builtin());
            let store = Arc::new(InMemoryStore::new(registry.clone()));
            let recorder = Arc::new(InMemoryEventRecorder::new());
            let shutdown = CancellationToken::new();
            let (tx, _rx) = mpsc::unbounded_channel();

            let app_kind = registry.resolve("App").unwrap().clone();
            let primary = Arc::new(ResourceCache::new(app_kind.clone(), KeyMapper::identity()));
            let mut caches = vec![primary.clone()];
            let mut engine = ReconcileEngine::new(
                registry.clone(),
                store.clone(),
                primary,
                Arc::new(AppDesiredState),
                recorder.clone(),
            );
            for kind in ["Deployment", "Service", "Ingress"] {
                let cache = Arc::new(ResourceCache::new(
                    registry.resolve(kind).unwrap().clone(),
                    KeyMapper::controller_owner(&app_kind),
                ));
                engine = engine.with_dependent_cache(cache.clone());
                caches.push(cache);
            }

            for cache in &caches {
                tokio::spawn(cache.clone().run(store.clone(), tx.clone(), shutdown.clone()));
            }
            for cache in &caches {
                cache.wait_for_sync(Duration::from_secs(5)).await.unwrap();
            }

            Self {
                registry,
                store,
                caches,
                recorder,
                engine,
                shutdown,
            }
        }

        fn kind(&self, name: &str) -> ResourceKind {
            self.registry.resolve(name).unwrap().clone()
        }

        /// Wait until every cache mirrors the store
        async fn settle(&self) {
            timeout(Duration::from_secs(5), async {
                loop {
                    let mut in_sync = true;
                    for cache in &self.caches {
                        let want: Vec<_> = self
                            .store
                            .objects(cache.kind())
                            .await
                            .into_iter()
                            .map(|o| (o.metadata.name, o.metadata.resource_version))
                            .collect();
                        let have: Vec<_> = cache
                            .list(None)
                            .unwrap()
                            .into_iter()
                            .map(|o| (o.metadata.name, o.metadata.resource_version))
                            .collect();
                        in_sync &= want == have;
                    }
                    if in_sync {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("caches did not settle");
        }

        async fn submit_app(&self, name: &str, dependents: Value) -> DynamicObject {
            let object: DynamicObject = serde_json::from_value(json!({
                "apiVersion": "groupkind.io/v1alpha1",
                "kind": "App",
                "metadata": { "name": name, "namespace": "default" },
                "spec": { "dependents": dependents },
            }))
            .unwrap();
            let stored = self.store.upsert(&self.kind("App"), object).await;
            self.settle().await;
            stored
        }

        async fn submit_deployment(&self, name: &str, owner: Option<OwnerReference>) -> DynamicObject {
            let mut object: DynamicObject = serde_json::from_value(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": name, "namespace": "default" },
                "spec": { "replicas": 1 },
            }))
            .unwrap();
            object.metadata.owner_references = owner.map(|o| vec![o]);
            let stored = self.store.upsert(&self.kind("Deployment"), object).await;
            self.settle().await;
            stored
        }

        async fn deployment(&self, name: &str) -> Option<DynamicObject> {
            self.store
                .get(&self.kind("Deployment"), Some("default"), name)
                .await
                .ok()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn sample_deployment() -> Value {
        json!([{ "kind": "Deployment", "name": "sample-dep", "replicas": 2, "image": "nginx:latest" }])
    }

    fn owner_ref(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "groupkind.io/v1alpha1".into(),
            kind: "App".into(),
            name: "sample".into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn outcomes_map_to_queue_actions() {
        assert_eq!(Outcome::Success.action(), QueueAction::Forget);
        assert_eq!(Outcome::Done.action(), QueueAction::Forget);
        assert_eq!(Outcome::Retry("x".into()).action(), QueueAction::Requeue);
        assert_eq!(Outcome::Conflict("x".into()).action(), QueueAction::Requeue);
        assert_eq!(Outcome::Invalid("x".into()).action(), QueueAction::Drop);
    }

    #[tokio::test]
    async fn missing_primary_is_done_without_writes() {
        let h = Harness::start().await;
        for key in ["default/ghost", "other/ghost", "ghost"] {
            assert_eq!(h.engine.reconcile(key).await, Outcome::Done);
        }
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn malformed_key_is_invalid() {
        let h = Harness::start().await;
        for key in ["", "a/b/c", "/name", "ns/"] {
            assert!(matches!(h.engine.reconcile(key).await, Outcome::Invalid(_)));
        }
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn empty_dependents_succeed_without_writes() {
        let h = Harness::start().await;
        h.submit_app("empty", json!([])).await;

        assert_eq!(h.engine.reconcile("default/empty").await, Outcome::Success);
        assert_eq!(h.engine.reconcile("default/empty").await, Outcome::Success);
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn sample_app_creates_one_owned_deployment_then_is_a_noop() {
        let h = Harness::start().await;
        let app = h.submit_app("sample", sample_deployment()).await;

        assert_eq!(h.engine.reconcile("default/sample").await, Outcome::Success);
        assert_eq!(h.store.create_count(), 1);

        let dep = h.deployment("sample-dep").await.expect("deployment created");
        assert_eq!(dep.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(dep.data["spec"]["replicas"], 2);
        assert_eq!(
            dep.data["spec"]["template"]["spec"]["containers"][0]["image"],
            "nginx:latest"
        );
        let refs = dep.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs[0].name, "sample");
        assert_eq!(refs[0].uid, app.metadata.uid.clone().unwrap());

        h.settle().await;
        assert_eq!(h.engine.reconcile("default/sample").await, Outcome::Success);
        assert_eq!(h.store.write_count(), 1);
        assert_eq!(h.recorder.with_reason(REASON_SYNCED).len(), 2);
    }

    #[tokio::test]
    async fn partial_progress_is_completed_without_duplicates() {
        let h = Harness::start().await;
        let app = h
            .submit_app(
                "sample",
                json!([
                    { "kind": "Deployment", "name": "sample-dep", "replicas": 2, "image": "nginx:latest" },
                    { "kind": "Service", "name": "sample-svc" }
                ]),
            )
            .await;

        // a previous pass created the deployment and stopped
        let owner = owner_ref(app.metadata.uid.as_deref().unwrap());
        let before = h.submit_deployment("sample-dep", Some(owner)).await;

        assert_eq!(h.engine.reconcile("default/sample").await, Outcome::Success);
        assert_eq!(h.store.create_count(), 1);
        assert_eq!(h.store.objects(&h.kind("Service")).await.len(), 1);

        // the existing deployment was brought to the declared replicas
        let after = h.deployment("sample-dep").await.unwrap();
        assert_eq!(after.metadata.uid, before.metadata.uid);
        assert_eq!(after.data["spec"]["replicas"], 2);
    }

    #[tokio::test]
    async fn unowned_dependent_is_a_conflict_and_left_alone() {
        let h = Harness::start().await;
        let foreign = h.submit_deployment("sample-dep", None).await;
        h.submit_app("sample", sample_deployment()).await;

        let outcome = h.engine.reconcile("default/sample").await;
        assert!(matches!(outcome, Outcome::Conflict(_)), "{outcome:?}");
        assert_eq!(h.store.write_count(), 0);

        let after = h.deployment("sample-dep").await.unwrap();
        assert_eq!(after.metadata.resource_version, foreign.metadata.resource_version);
        assert!(after.metadata.owner_references.is_none());

        let events = h.recorder.with_reason(REASON_RESOURCE_EXISTS);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name.as_deref(), Some("sample"));
        assert!(events[0].message.contains("sample-dep"));
    }

    #[tokio::test]
    async fn dependent_of_another_app_instance_is_a_conflict() {
        let h = Harness::start().await;
        h.submit_deployment("sample-dep", Some(owner_ref("uid-of-a-deleted-app")))
            .await;
        h.submit_app("sample", sample_deployment()).await;

        assert!(matches!(
            h.engine.reconcile("default/sample").await,
            Outcome::Conflict(_)
        ));
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn conflict_stops_the_remaining_dependents() {
        let h = Harness::start().await;
        h.submit_deployment("taken", None).await;
        h.submit_app(
            "sample",
            json!([
                { "kind": "Deployment", "name": "taken", "image": "nginx" },
                { "kind": "Service", "name": "sample-svc" }
            ]),
        )
        .await;

        assert!(matches!(
            h.engine.reconcile("default/sample").await,
            Outcome::Conflict(_)
        ));
        assert!(h.store.objects(&h.kind("Service")).await.is_empty());
    }

    #[tokio::test]
    async fn create_race_is_retried() {
        let h = Harness::start().await;
        h.submit_app("sample", sample_deployment()).await;
        h.store
            .fail_next(StoreOp::Create, StoreError::AlreadyExists("Deployment sample-dep".into()))
            .await;

        assert!(matches!(
            h.engine.reconcile("default/sample").await,
            Outcome::Retry(_)
        ));
        assert!(h.recorder.with_reason(REASON_CREATE_FAILED).is_empty());
    }

    #[tokio::test]
    async fn transient_create_failure_is_retried_and_reported() {
        let h = Harness::start().await;
        h.submit_app("sample", sample_deployment()).await;
        h.store
            .fail_next(StoreOp::Create, StoreError::Transient("etcd timeout".into()))
            .await;

        assert!(matches!(
            h.engine.reconcile("default/sample").await,
            Outcome::Retry(_)
        ));
        assert_eq!(h.recorder.with_reason(REASON_CREATE_FAILED).len(), 1);

        assert_eq!(h.engine.reconcile("default/sample").await, Outcome::Success);
        assert_eq!(h.store.create_count(), 1);
    }

    #[tokio::test]
    async fn fatal_create_failure_drops_the_key() {
        let h = Harness::start().await;
        h.submit_app("sample", sample_deployment()).await;
        h.store
            .fail_next(StoreOp::Create, StoreError::Fatal("forbidden".into()))
            .await;

        assert!(matches!(
            h.engine.reconcile("default/sample").await,
            Outcome::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn invalid_spec_is_reported_and_not_retried() {
        let h = Harness::start().await;
        h.submit_app(
            "sample",
            json!([{ "kind": "Deployment", "name": "web", "replicas": -3, "image": "nginx" }]),
        )
        .await;

        let outcome = h.engine.reconcile("default/sample").await;
        assert_eq!(outcome.action(), QueueAction::Drop);
        assert_eq!(h.store.write_count(), 0);
        assert_eq!(h.recorder.with_reason(REASON_INVALID_SPEC).len(), 1);
    }

    #[tokio::test]
    async fn drifted_dependent_is_patched_back() {
        let h = Harness::start().await;
        let app = h.submit_app("sample", sample_deployment()).await;
        assert_eq!(h.engine.reconcile("default/sample").await, Outcome::Success);
        h.settle().await;

        // someone scales the deployment by hand
        let mut scaled = h.deployment("sample-dep").await.unwrap();
        scaled.data["spec"]["replicas"] = json!(7);
        h.store.upsert(&h.kind("Deployment"), scaled).await;
        h.settle().await;

        assert_eq!(h.engine.reconcile("default/sample").await, Outcome::Success);
        assert_eq!(h.store.patch_count(), 1);
        let dep = h.deployment("sample-dep").await.unwrap();
        assert_eq!(dep.data["spec"]["replicas"], 2);
        assert_eq!(
            dep.metadata.owner_references.unwrap()[0].uid,
            app.metadata.uid.unwrap()
        );
    }

    #[tokio::test]
    async fn primary_being_deleted_is_done() {
        let h = Harness::start().await;
        let mut app: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "groupkind.io/v1alpha1",
            "kind": "App",
            "metadata": { "name": "sample", "namespace": "default" },
            "spec": { "dependents": sample_deployment() },
        }))
        .unwrap();
        app.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        h.store.upsert(&h.kind("App"), app).await;
        h.settle().await;

        assert_eq!(h.engine.reconcile("default/sample").await, Outcome::Done);
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn unsynced_cache_asks_for_a_retry() {
        let registry = Arc::new(KindRegistry::builtin());
        let store = Arc::new(InMemoryStore::new(registry.clone()));
        let primary = Arc::new(ResourceCache::new(
            registry.resolve("App").unwrap().clone(),
            KeyMapper::identity(),
        ));
        let engine = ReconcileEngine::new(
            registry,
            store,
            primary,
            Arc::new(AppDesiredState),
            Arc::new(InMemoryEventRecorder::new()),
        );
        assert!(matches!(
            engine.reconcile("default/sample").await,
            Outcome::Retry(_)
        ));
    }
}
