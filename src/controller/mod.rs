//! Controller for App resources
//!
//! Wires the pieces together: one [`ResourceCache`] per watched kind,
//! a rate-limited [`WorkQueue`] of App keys, the [`ReconcileEngine`]
//! and a [`Dispatcher`] worker pool.

pub mod cache;
pub mod dispatcher;
pub mod events;
pub mod key;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ownership;
pub mod queue;
pub mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod resources;

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::KindRegistry;
use crate::store::Store;

pub use cache::{KeyMapper, ResourceCache, SyncState};
pub use dispatcher::{Dispatcher, Reconcile};
pub use events::{
    EventRecorder, EventType, InMemoryEventRecorder, KubeEventRecorder, LogEventRecorder,
};
pub use key::ObjectKey;
pub use ownership::{is_owned_by, OwnerIdentity};
pub use queue::{RateLimiter, WorkQueue};
pub use reconciler::{Outcome, QueueAction, ReconcileEngine, DEFAULT_FIELD_MANAGER};
pub use resources::{AppDesiredState, DesiredState};

/// Tunables of a running controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Parallel reconciles
    pub workers: usize,
    /// Watch a single namespace instead of the whole cluster
    pub namespace: Option<String>,
    /// How long startup waits for every cache to list
    pub sync_timeout: Duration,
    /// Re-enqueue every App at this interval
    pub resync_period: Option<Duration>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
    /// How long in-flight reconciles may run after shutdown
    pub shutdown_grace: Duration,
    pub field_manager: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            namespace: None,
            sync_timeout: Duration::from_secs(60),
            resync_period: None,
            base_delay: queue::DEFAULT_BASE_DELAY,
            max_delay: queue::DEFAULT_MAX_DELAY,
            qps: queue::DEFAULT_QPS,
            burst: queue::DEFAULT_BURST,
            shutdown_grace: dispatcher::DEFAULT_SHUTDOWN_GRACE,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".into()));
        }
        if !(self.qps.is_finite() && self.qps >= queue::MIN_QPS) {
            return Err(Error::ConfigError(format!(
                "qps must be a finite value of at least {}, got {}",
                queue::MIN_QPS,
                self.qps
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::ConfigError(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.field_manager.is_empty() {
            return Err(Error::ConfigError("field manager must not be empty".into()));
        }
        Ok(())
    }
}

/// Whether every cache has completed its initial list
#[derive(Clone)]
pub struct Readiness {
    caches: Vec<Arc<ResourceCache>>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.caches.iter().all(|c| c.is_synced())
    }

    /// Kinds whose cache has not synced yet
    pub fn pending(&self) -> Vec<String> {
        self.caches
            .iter()
            .filter(|c| !c.is_synced())
            .map(|c| c.kind().kind().to_string())
            .collect()
    }
}

pub struct Controller {
    config: ControllerConfig,
    registry: Arc<KindRegistry>,
    store: Arc<dyn Store>,
    recorder: Arc<dyn EventRecorder>,
    desired: Arc<dyn DesiredState>,
    primary: Arc<ResourceCache>,
    dependents: Vec<Arc<ResourceCache>>,
}

impl Controller {
    /// Controller for Apps and their Deployments, Services and Ingresses
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn Store>,
        registry: Arc<KindRegistry>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Result<Self> {
        Self::with_desired_state(config, store, registry, recorder, Arc::new(AppDesiredState))
    }

    pub fn with_desired_state(
        config: ControllerConfig,
        store: Arc<dyn Store>,
        registry: Arc<KindRegistry>,
        recorder: Arc<dyn EventRecorder>,
        desired: Arc<dyn DesiredState>,
    ) -> Result<Self> {
        config.validate()?;

        let primary_kind = registry.resolve(desired.primary_kind())?.clone();
        let primary = Arc::new(
            ResourceCache::new(primary_kind.clone(), KeyMapper::identity())
                .with_namespace(config.namespace.clone())
                .with_resync(config.resync_period),
        );

        let dependents = desired
            .dependent_kinds()
            .iter()
            .map(|kind| {
                let kind = registry.resolve(kind)?.clone();
                Ok(Arc::new(
                    ResourceCache::new(kind, KeyMapper::controller_owner(&primary_kind))
                        .with_namespace(config.namespace.clone()),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            registry,
            store,
            recorder,
            desired,
            primary,
            dependents,
        })
    }

    fn caches(&self) -> impl Iterator<Item = &Arc<ResourceCache>> {
        std::iter::once(&self.primary).chain(self.dependents.iter())
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            caches: self.caches().cloned().collect(),
        }
    }

    /// Start the caches, wait for them to sync, then reconcile until
    /// `shutdown` fires.
    ///
    /// A cache that cannot complete its first list is fatal.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (keys_tx, keys_rx) = mpsc::unbounded_channel();
        let stop_caches = CancellationToken::new();

        let cache_tasks: Vec<_> = self
            .caches()
            .map(|cache| {
                tokio::spawn(cache.clone().run(
                    self.store.clone(),
                    keys_tx.clone(),
                    stop_caches.clone(),
                ))
            })
            .collect();
        drop(keys_tx);

        info!(
            kinds = ?self.caches().map(|c| c.kind().kind()).collect::<Vec<_>>(),
            "waiting for caches to sync"
        );
        let timeout = self.config.sync_timeout;
        let synced = tokio::select! {
            _ = shutdown.cancelled() => None,
            synced = try_join_all(self.caches().map(|c| c.wait_for_sync(timeout))) => Some(synced),
        };
        match synced {
            None => {
                stop_caches.cancel();
                return Ok(());
            }
            Some(Err(e)) => {
                stop_caches.cancel();
                return Err(e);
            }
            Some(Ok(_)) => info!("caches synced"),
        }

        let queue = WorkQueue::new(
            self.primary.kind().kind().to_lowercase(),
            queue::controller_rate_limiter(
                self.config.base_delay,
                self.config.max_delay,
                self.config.qps,
                self.config.burst,
            ),
        );
        let forwarder = tokio::spawn(dispatcher::forward(queue.clone(), keys_rx, shutdown.clone()));

        let mut engine = ReconcileEngine::new(
            self.registry.clone(),
            self.store.clone(),
            self.primary.clone(),
            self.desired.clone(),
            self.recorder.clone(),
        )
        .with_field_manager(self.config.field_manager.clone());
        for cache in &self.dependents {
            engine = engine.with_dependent_cache(cache.clone());
        }

        Dispatcher::new(queue, Arc::new(engine), self.config.workers)
            .with_shutdown_grace(self.config.shutdown_grace)
            .run(shutdown)
            .await;

        stop_caches.cancel();
        if let Err(e) = forwarder.await {
            warn!(error = %e, "forwarder ended abnormally");
        }
        for task in cache_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "cache task ended abnormally");
            }
        }
        info!("controller stopped");
        Ok(())
    }
}

/// Run the App controller until `shutdown` fires
pub async fn run_controller(
    config: ControllerConfig,
    store: Arc<dyn Store>,
    registry: Arc<KindRegistry>,
    recorder: Arc<dyn EventRecorder>,
    shutdown: CancellationToken,
) -> Result<()> {
    Controller::new(config, store, registry, recorder)?
        .run(shutdown)
        .await
}
