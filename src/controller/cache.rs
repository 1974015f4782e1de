//! Local mirror of one resource kind
//!
//! A [`ResourceCache`] lists its kind from the [`Store`], then follows a
//! watch from the listed resource version, resuming from the last seen
//! version whenever the server ends the watch. Every applied change is
//! turned into the key of the primary resource it concerns by a
//! [`KeyMapper`] and sent to the dispatcher, after the mirror has been
//! updated. Reads are served from the mirror only and fail with
//! [`Error::CacheNotSynced`] until the first list has been applied.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::StreamExt;
use kube::core::DynamicObject;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::controller::key::ObjectKey;
use crate::controller::ownership::{api_group, controller_ref};
use crate::error::{Error, Result};
use crate::registry::ResourceKind;
use crate::store::{Store, StoreError, WatchEvent};

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// A watch that ends sooner than this with no events counts as a failure
const MIN_WATCH_LIFETIME: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Synced,
    Failed(String),
}

type MapFn = dyn Fn(&DynamicObject) -> Option<ObjectKey> + Send + Sync;

/// Translates a changed object into the key to reconcile
#[derive(Clone)]
pub struct KeyMapper(Arc<MapFn>);

impl KeyMapper {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&DynamicObject) -> Option<ObjectKey> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// The object's own key; used for the primary kind
    pub fn identity() -> Self {
        Self::new(ObjectKey::from_object)
    }

    /// Key of the controlling owner, when that owner is of kind `owner`
    pub fn controller_owner(owner: &ResourceKind) -> Self {
        let kind = owner.kind().to_string();
        let group = owner.group().to_string();
        Self::new(move |object| {
            let reference = controller_ref(&object.metadata)?;
            if reference.kind != kind || api_group(&reference.api_version) != group {
                return None;
            }
            Some(ObjectKey::new(
                object.metadata.namespace.as_deref(),
                &reference.name,
            ))
        })
    }

    pub fn map(&self, object: &DynamicObject) -> Option<ObjectKey> {
        (self.0)(object)
    }
}

impl fmt::Debug for KeyMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMapper")
    }
}

/// Whether `candidate` is older than `held`.
///
/// Versions are opaque; they are only compared when both are numeric.
fn is_older(candidate: Option<&str>, held: Option<&str>) -> bool {
    match (
        candidate.and_then(|v| v.parse::<u64>().ok()),
        held.and_then(|v| v.parse::<u64>().ok()),
    ) {
        (Some(candidate), Some(held)) => candidate < held,
        _ => false,
    }
}

pub struct ResourceCache {
    kind: ResourceKind,
    namespace: Option<String>,
    mapper: KeyMapper,
    entries: RwLock<HashMap<ObjectKey, DynamicObject>>,
    state: watch::Sender<SyncState>,
    resync: Option<Duration>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl ResourceCache {
    pub fn new(kind: ResourceKind, mapper: KeyMapper) -> Self {
        let (state, _) = watch::channel(SyncState::Pending);
        Self {
            kind,
            namespace: None,
            mapper,
            entries: RwLock::new(HashMap::new()),
            state,
            resync: None,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }

    /// Only mirror objects in `namespace`
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Re-emit the key of every cached object at this interval
    pub fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync = period.filter(|p| !p.is_zero());
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn is_synced(&self) -> bool {
        *self.state.borrow() == SyncState::Synced
    }

    /// Wait for the first list to be applied
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|s| *s != SyncState::Pending))
            .await
            .map_err(|_| Error::SyncTimeout(timeout))?
            .map(|s| s.clone())
            .map_err(|_| Error::CacheSync {
                kind: self.kind.kind().to_string(),
                reason: "cache stopped".to_string(),
            })?;

        match settled {
            SyncState::Failed(reason) => Err(Error::CacheSync {
                kind: self.kind.kind().to_string(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, DynamicObject>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, DynamicObject>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_synced(&self) -> Result<()> {
        if self.is_synced() {
            Ok(())
        } else {
            Err(Error::CacheNotSynced {
                kind: self.kind.kind().to_string(),
            })
        }
    }

    /// Cached object, `None` when absent
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        self.ensure_synced()?;
        Ok(self.read().get(&ObjectKey::new(namespace, name)).cloned())
    }

    /// Cached objects, optionally restricted to one namespace
    pub fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        self.ensure_synced()?;
        let entries = self.read();
        let mut objects: Vec<_> = entries
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace.as_deref() == Some(ns)))
            .map(|(_, o)| o.clone())
            .collect();
        objects.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(objects)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, object: &DynamicObject, tx: &mpsc::UnboundedSender<ObjectKey>) {
        if let Some(key) = self.mapper.map(object) {
            // receiver gone means the controller is stopping
            let _ = tx.send(key);
        }
    }

    /// Apply one watch event, then notify. Returns whether it was applied.
    fn apply(&self, event: WatchEvent, tx: &mpsc::UnboundedSender<ObjectKey>) -> bool {
        let (event_type, object) = match event {
            WatchEvent::Bookmark(_) => return false,
            WatchEvent::Added(o) => ("added", o),
            WatchEvent::Modified(o) => ("modified", o),
            WatchEvent::Deleted(o) => ("deleted", o),
        };
        let Some(key) = ObjectKey::from_object(&object) else {
            warn!(kind = %self.kind.kind(), "ignoring watch event for an object without a name");
            return false;
        };

        {
            let mut entries = self.write();
            let held = entries
                .get(&key)
                .and_then(|o| o.metadata.resource_version.as_deref());
            if is_older(object.metadata.resource_version.as_deref(), held) {
                trace!(kind = %self.kind.kind(), %key, "ignoring stale event");
                return false;
            }
            if event_type == "deleted" {
                entries.remove(&key);
            } else {
                entries.insert(key.clone(), object.clone());
            }
        }

        #[cfg(feature = "metrics")]
        super::metrics::record_cache_event(self.kind.kind(), event_type);
        trace!(kind = %self.kind.kind(), %key, event_type, "applied");

        self.notify(&object, tx);
        true
    }

    /// Replace the mirror with a fresh list.
    ///
    /// Entries missing from the list are reported as deletions.
    fn replace(&self, items: Vec<DynamicObject>, tx: &mpsc::UnboundedSender<ObjectKey>) {
        let mut touched = Vec::with_capacity(items.len());
        let vanished: Vec<DynamicObject> = {
            let mut entries = self.write();
            let mut fresh = HashMap::with_capacity(items.len());
            for object in items {
                let Some(key) = ObjectKey::from_object(&object) else {
                    continue;
                };
                let object = match entries.remove(&key) {
                    Some(held)
                        if is_older(
                            object.metadata.resource_version.as_deref(),
                            held.metadata.resource_version.as_deref(),
                        ) =>
                    {
                        held
                    }
                    _ => object,
                };
                touched.push(object.clone());
                fresh.insert(key, object);
            }
            let vanished = entries.drain().map(|(_, o)| o).collect();
            *entries = fresh;
            vanished
        };

        debug!(
            kind = %self.kind.kind(),
            listed = touched.len(),
            vanished = vanished.len(),
            "cache replaced"
        );
        for object in vanished.iter().chain(touched.iter()) {
            self.notify(object, tx);
        }
    }

    fn resync_all(&self, tx: &mpsc::UnboundedSender<ObjectKey>) {
        let objects: Vec<DynamicObject> = self.read().values().cloned().collect();
        trace!(kind = %self.kind.kind(), count = objects.len(), "resync");
        for object in &objects {
            self.notify(object, tx);
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .checked_mul(2u32.saturating_pow(attempt.min(16)))
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max);
        let millis = u64::try_from(exp.as_millis()).unwrap_or(u64::MAX);
        let jitter_range = (millis / 4).max(1);
        Duration::from_millis(millis.saturating_add(rand::random::<u64>() % jitter_range))
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// List-then-watch until `shutdown` is cancelled
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn Store>,
        tx: mpsc::UnboundedSender<ObjectKey>,
        shutdown: CancellationToken,
    ) {
        let kind = self.kind.clone();
        let namespace = self.namespace.clone();
        let mut attempt = 0u32;
        let mut resync = self.resync.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(kind = %kind.kind(), namespace = ?namespace, "starting cache");

        'relist: loop {
            let listed = tokio::select! {
                _ = shutdown.cancelled() => break,
                listed = store.list(&kind, namespace.as_deref()) => listed,
            };
            let mut resource_version = match listed {
                Ok(list) => {
                    attempt = 0;
                    self.replace(list.items, &tx);
                    if !self.is_synced() {
                        info!(kind = %kind.kind(), objects = self.len(), "cache synced");
                    }
                    self.set_state(SyncState::Synced);
                    list.resource_version
                }
                Err(e) if e.is_fatal() && !self.is_synced() => {
                    error!(kind = %kind.kind(), error = %e, "initial list failed");
                    self.set_state(SyncState::Failed(e.to_string()));
                    return;
                }
                Err(e) => {
                    warn!(kind = %kind.kind(), error = %e, attempt, "list failed");
                    if !self.sleep(attempt, &shutdown).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            // Resume from the last seen version until the watch expires or fails
            loop {
                let watched = tokio::select! {
                    _ = shutdown.cancelled() => break 'relist,
                    watched = store.watch(&kind, namespace.as_deref(), &resource_version) => watched,
                };
                let mut events = match watched {
                    Ok(events) => events,
                    Err(StoreError::Expired(reason)) => {
                        debug!(kind = %kind.kind(), %reason, "resource version expired, relisting");
                        continue 'relist;
                    }
                    Err(e) => {
                        warn!(kind = %kind.kind(), error = %e, attempt, "watch failed");
                        break;
                    }
                };

                let opened = Instant::now();
                let mut received = 0usize;
                let end = loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!(kind = %kind.kind(), "cache stopped");
                            return;
                        }
                        _ = tick(&mut resync) => self.resync_all(&tx),
                        event = events.next() => match event {
                            Some(Ok(event)) => {
                                received += 1;
                                if let Some(rv) = event.resource_version() {
                                    resource_version = rv.to_string();
                                }
                                self.apply(event, &tx);
                            }
                            Some(Err(StoreError::Expired(reason))) => {
                                debug!(kind = %kind.kind(), %reason, "watch expired, relisting");
                                break WatchEnd::Expired;
                            }
                            Some(Err(e)) => {
                                warn!(kind = %kind.kind(), error = %e, "watch error");
                                break WatchEnd::Failed;
                            }
                            None => break WatchEnd::Closed,
                        },
                    }
                };

                match end {
                    WatchEnd::Expired => continue 'relist,
                    WatchEnd::Failed => break,
                    WatchEnd::Closed
                        if received > 0 || opened.elapsed() >= MIN_WATCH_LIFETIME =>
                    {
                        debug!(
                            kind = %kind.kind(),
                            %resource_version,
                            received,
                            "watch closed, resuming"
                        );
                        attempt = 0;
                    }
                    WatchEnd::Closed => {
                        debug!(
                            kind = %kind.kind(),
                            %resource_version,
                            "watch closed right after opening"
                        );
                        break;
                    }
                }
            }

            if !self.sleep(attempt, &shutdown).await {
                break;
            }
            attempt = attempt.saturating_add(1);
        }

        info!(kind = %kind.kind(), "cache stopped");
    }

    /// Back off before the next attempt; `false` when cancelled
    async fn sleep(&self, attempt: u32, shutdown: &CancellationToken) -> bool {
        let delay = self.backoff(attempt);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

enum WatchEnd {
    Closed,
    Expired,
    Failed,
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
