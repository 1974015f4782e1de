//! Full controller runs against the in-memory store
//!
//! Each test starts the whole controller (caches, queue, workers), acts
//! on the store the way a user or another controller would, and waits
//! for the cluster state to converge.

use std::sync::Arc;
use std::time::Duration;

use groupkind_controller::controller::events::{REASON_RESOURCE_EXISTS, REASON_SYNCED};
use groupkind_controller::controller::{
    run_controller, Controller, ControllerConfig, InMemoryEventRecorder,
};
use groupkind_controller::registry::{KindRegistry, ResourceKind};
use groupkind_controller::store::{InMemoryStore, StoreError, StoreOp};
use groupkind_controller::Error;
use kube::core::DynamicObject;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Running {
    registry: Arc<KindRegistry>,
    store: Arc<InMemoryStore>,
    recorder: Arc<InMemoryEventRecorder>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), Error>>,
}

fn config() -> ControllerConfig {
    ControllerConfig {
        sync_timeout: Duration::from_secs(5),
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(5),
        ..ControllerConfig::default()
    }
}

impl Running {
    async fn start() -> Self {
        let registry = Arc::new(KindRegistry::builtin());
        let store = Arc::new(InMemoryStore::new(registry.clone()));
        Self::start_with(registry, store).await
    }

    async fn start_with(registry: Arc<KindRegistry>, store: Arc<InMemoryStore>) -> Self {
        let recorder = Arc::new(InMemoryEventRecorder::new());
        let shutdown = CancellationToken::new();
        let controller = Controller::new(
            config(),
            store.clone(),
            registry.clone(),
            recorder.clone(),
        )
        .expect("valid controller");
        let readiness = controller.readiness();
        let handle = tokio::spawn(controller.run(shutdown.clone()));

        eventually(|| readiness.is_ready()).await;
        Self {
            registry,
            store,
            recorder,
            shutdown,
            handle,
        }
    }

    fn kind(&self, name: &str) -> ResourceKind {
        self.registry.resolve(name).unwrap().clone()
    }

    async fn submit(&self, kind: &str, value: Value) -> DynamicObject {
        let object: DynamicObject = serde_json::from_value(value).unwrap();
        self.store.upsert(&self.kind(kind), object).await
    }

    async fn submit_app(&self, name: &str, dependents: Value) -> DynamicObject {
        self.submit(
            "App",
            json!({
                "apiVersion": "groupkind.io/v1alpha1",
                "kind": "App",
                "metadata": { "name": name, "namespace": "default" },
                "spec": { "dependents": dependents },
            }),
        )
        .await
    }

    async fn find(&self, kind: &str, name: &str) -> Option<DynamicObject> {
        self.store
            .objects(&self.kind(kind))
            .await
            .into_iter()
            .find(|o| o.metadata.name.as_deref() == Some(name))
    }

    async fn wait_for(&self, kind: &str, name: &str, check: impl Fn(&DynamicObject) -> bool) {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(object) = self.find(kind, name).await {
                    if check(&object) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{kind} {name} did not converge"));
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("controller stopped in time")
            .expect("controller task");
        assert!(result.is_ok(), "{result:?}");
    }
}

async fn eventually(check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn owned_by(object: &DynamicObject, app: &DynamicObject) -> bool {
    object
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && Some(&r.uid) == app.metadata.uid.as_ref())
}

#[tokio::test]
async fn sample_app_gets_an_owned_deployment() {
    let running = Running::start().await;
    let app = running
        .submit_app(
            "sample",
            json!([{ "kind": "Deployment", "name": "sample-dep", "replicas": 2, "image": "nginx:latest" }]),
        )
        .await;

    running
        .wait_for("Deployment", "sample-dep", |d| {
            owned_by(d, &app) && d.data["spec"]["replicas"] == 2
        })
        .await;
    eventually(|| !running.recorder.with_reason(REASON_SYNCED).is_empty()).await;
    assert_eq!(running.store.objects(&running.kind("Deployment")).await.len(), 1);

    running.stop().await;
}

#[tokio::test]
async fn every_dependent_kind_is_created() {
    let running = Running::start().await;
    let app = running
        .submit_app(
            "shop",
            json!([
                { "kind": "Deployment", "name": "shop", "replicas": 1, "image": "shop:1.0" },
                { "kind": "Service", "name": "shop", "port": 80, "targetPort": 8080 },
                { "kind": "Ingress", "name": "shop", "serviceName": "shop", "servicePort": 80 }
            ]),
        )
        .await;

    for kind in ["Deployment", "Service", "Ingress"] {
        running.wait_for(kind, "shop", |o| owned_by(o, &app)).await;
    }

    running.stop().await;
}

#[tokio::test]
async fn deleted_dependent_is_recreated() {
    let running = Running::start().await;
    let app = running
        .submit_app(
            "sample",
            json!([{ "kind": "Deployment", "name": "sample-dep", "replicas": 1, "image": "nginx:latest" }]),
        )
        .await;
    running.wait_for("Deployment", "sample-dep", |d| owned_by(d, &app)).await;
    let first_uid = running
        .find("Deployment", "sample-dep")
        .await
        .and_then(|d| d.metadata.uid);

    running
        .store
        .remove(&running.kind("Deployment"), Some("default"), "sample-dep")
        .await
        .expect("deployment existed");

    running
        .wait_for("Deployment", "sample-dep", |d| {
            owned_by(d, &app) && d.metadata.uid != first_uid
        })
        .await;

    running.stop().await;
}

#[tokio::test]
async fn drifted_dependent_is_corrected() {
    let running = Running::start().await;
    let app = running
        .submit_app(
            "sample",
            json!([{ "kind": "Deployment", "name": "sample-dep", "replicas": 3, "image": "nginx:latest" }]),
        )
        .await;
    running
        .wait_for("Deployment", "sample-dep", |d| owned_by(d, &app))
        .await;

    // someone scales the deployment by hand
    let mut scaled = running.find("Deployment", "sample-dep").await.unwrap();
    scaled.data["spec"]["replicas"] = json!(1);
    running.store.upsert(&running.kind("Deployment"), scaled).await;

    running
        .wait_for("Deployment", "sample-dep", |d| d.data["spec"]["replicas"] == 3)
        .await;

    running.stop().await;
}

#[tokio::test]
async fn unowned_dependent_is_reported_and_left_alone() {
    let running = Running::start().await;
    let foreign = running
        .submit(
            "Deployment",
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "sample-dep", "namespace": "default" },
                "spec": { "replicas": 5 },
            }),
        )
        .await;

    running
        .submit_app(
            "sample",
            json!([{ "kind": "Deployment", "name": "sample-dep", "replicas": 2, "image": "nginx:latest" }]),
        )
        .await;

    eventually(|| !running.recorder.with_reason(REASON_RESOURCE_EXISTS).is_empty()).await;
    let event = &running.recorder.with_reason(REASON_RESOURCE_EXISTS)[0];
    assert!(event.message.contains("sample-dep"), "{}", event.message);

    let after = running.find("Deployment", "sample-dep").await.unwrap();
    assert_eq!(after.metadata.resource_version, foreign.metadata.resource_version);
    assert_eq!(after.data["spec"]["replicas"], 5);
    assert_eq!(running.store.write_count(), 0);

    running.stop().await;
}

#[tokio::test]
async fn transient_create_failure_is_retried() {
    let running = Running::start().await;
    running
        .store
        .fail_next(StoreOp::Create, StoreError::Transient("etcd leader changed".into()))
        .await;

    let app = running
        .submit_app(
            "sample",
            json!([{ "kind": "Deployment", "name": "sample-dep", "replicas": 1, "image": "nginx:latest" }]),
        )
        .await;

    running.wait_for("Deployment", "sample-dep", |d| owned_by(d, &app)).await;
    assert_eq!(running.store.create_count(), 1);

    running.stop().await;
}

#[tokio::test]
async fn apps_present_before_startup_are_reconciled() {
    let registry = Arc::new(KindRegistry::builtin());
    let store = Arc::new(InMemoryStore::new(registry.clone()));
    let app_kind = registry.resolve("App").unwrap().clone();
    let app: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "groupkind.io/v1alpha1",
        "kind": "App",
        "metadata": { "name": "early", "namespace": "default" },
        "spec": { "dependents": [{ "kind": "Service", "name": "early", "port": 80 }] },
    }))
    .unwrap();
    let app = store.upsert(&app_kind, app).await;

    let running = Running::start_with(registry, store).await;
    running.wait_for("Service", "early", |s| owned_by(s, &app)).await;

    running.stop().await;
}

#[tokio::test]
async fn failed_initial_sync_is_fatal() {
    let registry = Arc::new(KindRegistry::builtin());
    let store = Arc::new(InMemoryStore::new(registry.clone()));
    store
        .fail_next(StoreOp::List, StoreError::Fatal("forbidden".into()))
        .await;

    let result = timeout(
        Duration::from_secs(10),
        run_controller(
            config(),
            store,
            registry,
            Arc::new(InMemoryEventRecorder::new()),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("startup gave up in time");

    assert!(matches!(result, Err(Error::CacheSync { .. })), "{result:?}");
}

#[tokio::test]
async fn shutdown_before_sync_returns_cleanly() {
    let registry = Arc::new(KindRegistry::builtin());
    let store = Arc::new(InMemoryStore::new(registry.clone()));
    // every list keeps failing, so the caches never sync
    for _ in 0..64 {
        store
            .fail_next(StoreOp::List, StoreError::Transient("unavailable".into()))
            .await;
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_controller(
        config(),
        store,
        registry,
        Arc::new(InMemoryEventRecorder::new()),
        shutdown.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    let result = timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller stopped in time")
        .expect("controller task");
    assert!(result.is_ok(), "{result:?}");
}
