//! Reconcile engine
//!
//! Drives the dependents of one primary resource towards the state it
//! declares. Reads come from the resource caches, writes go to the
//! [`Store`]. Every per-key failure is folded into an [`Outcome`] that
//! the dispatcher turns into a queue action.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::cache::ResourceCache;
use super::events::{
    object_reference, resource_exists_message, EventRecorder, EventType, MESSAGE_SYNCED,
    REASON_CREATE_FAILED, REASON_INVALID_SPEC, REASON_RESOURCE_EXISTS, REASON_SYNCED,
};
use super::key::ObjectKey;
use super::ownership::{is_owned_by, OwnerIdentity};
use super::resources::{is_converged, DesiredObject, DesiredState};
use crate::error::Error;
use crate::registry::{KindRegistry, ResourceKind};
use crate::store::{PatchOptions, Store, StoreError};

pub const DEFAULT_FIELD_MANAGER: &str = "groupkind-controller";

/// Result of one reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every dependent exists and is owned
    Success,
    /// Nothing to do: the primary is gone or being deleted
    Done,
    /// A transient failure; try again later
    Retry(String),
    /// A dependent exists but belongs to someone else
    Conflict(String),
    /// Retrying cannot help until the input changes
    Invalid(String),
}

/// What the queue does with a key after a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueAction {
    /// Reset the backoff and leave the key alone
    Forget,
    /// Requeue with backoff
    Requeue,
    /// Drop the key without resetting its backoff
    Drop,
}

impl Outcome {
    pub fn action(&self) -> QueueAction {
        match self {
            Outcome::Success | Outcome::Done => QueueAction::Forget,
            Outcome::Retry(_) | Outcome::Conflict(_) => QueueAction::Requeue,
            Outcome::Invalid(_) => QueueAction::Drop,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Done => "done",
            Outcome::Retry(_) => "retry",
            Outcome::Conflict(_) => "conflict",
            Outcome::Invalid(_) => "invalid",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Retry(reason) | Outcome::Conflict(reason) | Outcome::Invalid(reason) => {
                write!(f, "{}: {}", self.as_str(), reason)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

pub struct ReconcileEngine {
    registry: Arc<KindRegistry>,
    store: Arc<dyn Store>,
    primary: Arc<ResourceCache>,
    dependents: HashMap<String, Arc<ResourceCache>>,
    desired: Arc<dyn DesiredState>,
    recorder: Arc<dyn EventRecorder>,
    field_manager: String,
}

impl ReconcileEngine {
    pub fn new(
        registry: Arc<KindRegistry>,
        store: Arc<dyn Store>,
        primary: Arc<ResourceCache>,
        desired: Arc<dyn DesiredState>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            registry,
            store,
            primary,
            dependents: HashMap::new(),
            desired,
            recorder,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }

    /// Serve reads of this cache's kind from the cache
    pub fn with_dependent_cache(mut self, cache: Arc<ResourceCache>) -> Self {
        self.dependents
            .insert(cache.kind().kind().to_string(), cache);
        self
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    fn record(&self, primary: &DynamicObject, event_type: EventType, reason: &str, message: &str) {
        let reference = object_reference(primary, self.primary.kind());
        self.recorder.record(&reference, event_type, reason, message);
    }

    /// Reconcile the primary resource behind `key`
    #[instrument(skip(self), fields(kind = %self.primary.kind().kind()))]
    pub async fn reconcile(&self, key: &str) -> Outcome {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let outcome = self.reconcile_key(key).await;

        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile(
            self.primary.kind().kind(),
            outcome.as_str(),
            started.elapsed().as_secs_f64(),
        );

        match &outcome {
            Outcome::Success => info!(key, "synced"),
            Outcome::Done => debug!(key, "nothing to do"),
            Outcome::Retry(reason) => warn!(key, %reason, "will retry"),
            Outcome::Conflict(reason) => warn!(key, %reason, "ownership conflict"),
            Outcome::Invalid(reason) => error!(key, %reason, "dropping key"),
        }
        outcome
    }

    async fn reconcile_key(&self, key: &str) -> Outcome {
        let key = match ObjectKey::parse(key) {
            Ok(key) => key,
            Err(e) => return Outcome::Invalid(e.to_string()),
        };

        let primary = match self.primary.get(key.namespace.as_deref(), &key.name) {
            Ok(Some(primary)) => primary,
            Ok(None) => return Outcome::Done,
            Err(e) => return Outcome::Retry(e.to_string()),
        };
        if primary.metadata.deletion_timestamp.is_some() {
            debug!(%key, "being deleted");
            return Outcome::Done;
        }

        let Some(owner) = OwnerIdentity::of(&primary, self.primary.kind()) else {
            return Outcome::Retry(format!("{key} has no uid yet"));
        };

        let desired = match self.desired.desired(&primary, &owner) {
            Ok(desired) => desired,
            Err(e) => {
                let message = e.to_string();
                self.record(&primary, EventType::Warning, REASON_INVALID_SPEC, &message);
                return Outcome::Invalid(message);
            }
        };

        for dependent in &desired {
            if let Some(outcome) = self.converge(&primary, &owner, dependent).await {
                return outcome;
            }
        }

        self.record(&primary, EventType::Normal, REASON_SYNCED, MESSAGE_SYNCED);
        Outcome::Success
    }

    /// Bring one dependent in line; `Some` ends the reconcile
    async fn converge(
        &self,
        primary: &DynamicObject,
        owner: &OwnerIdentity,
        dependent: &DesiredObject,
    ) -> Option<Outcome> {
        let kind = match self.registry.resolve(&dependent.kind) {
            Ok(kind) => kind,
            Err(e) => return Some(Outcome::Invalid(e.to_string())),
        };
        let namespace = owner.namespace.as_deref();

        let existing = match self.lookup(kind, namespace, &dependent.name).await {
            Ok(existing) => existing,
            Err(e) => return Some(Outcome::Retry(e.to_string())),
        };

        let Some(existing) = existing else {
            return self.create(primary, kind, dependent).await;
        };

        if !is_owned_by(&existing.metadata, owner) {
            let message = resource_exists_message(&dependent.name);
            self.record(primary, EventType::Warning, REASON_RESOURCE_EXISTS, &message);
            return Some(Outcome::Conflict(format!(
                "{} {} is not controlled by {}",
                kind.kind(),
                dependent.name,
                owner.name
            )));
        }

        match is_converged(&existing, &dependent.managed) {
            Ok(true) => None,
            Ok(false) => self.correct_drift(primary, kind, &existing, dependent).await,
            Err(e) => Some(Outcome::Invalid(e.to_string())),
        }
    }

    async fn lookup(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        if let Some(cache) = self.dependents.get(kind.kind()) {
            return cache.get(namespace, name);
        }
        match self.store.get(kind, namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        primary: &DynamicObject,
        kind: &ResourceKind,
        dependent: &DesiredObject,
    ) -> Option<Outcome> {
        match self.store.create(kind, &dependent.object).await {
            Ok(_) => {
                info!(kind = %kind.kind(), name = %dependent.name, "created dependent");
                None
            }
            // a concurrent creator won; the next pass checks ownership
            Err(StoreError::AlreadyExists(what)) => {
                Some(Outcome::Retry(format!("{what} appeared concurrently")))
            }
            Err(e) => Some(self.write_failed(primary, kind, &dependent.name, e)),
        }
    }

    async fn correct_drift(
        &self,
        primary: &DynamicObject,
        kind: &ResourceKind,
        existing: &DynamicObject,
        dependent: &DesiredObject,
    ) -> Option<Outcome> {
        let mut patch = dependent.managed.clone();
        if let (Some(rv), Some(metadata)) = (
            existing.metadata.resource_version.as_ref(),
            patch.get_mut("metadata").and_then(Value::as_object_mut),
        ) {
            metadata.insert("resourceVersion".into(), Value::String(rv.clone()));
        }

        let options = PatchOptions {
            field_manager: Some(self.field_manager.clone()),
            dry_run: false,
        };
        let namespace = existing.metadata.namespace.as_deref();
        match self
            .store
            .patch(kind, namespace, &dependent.name, &patch, &options)
            .await
        {
            Ok(_) => {
                info!(kind = %kind.kind(), name = %dependent.name, "corrected drift");
                None
            }
            Err(StoreError::NotFound(what)) => Some(Outcome::Retry(format!("{what} vanished"))),
            Err(StoreError::Conflict(what)) => Some(Outcome::Retry(what)),
            Err(e) => Some(self.write_failed(primary, kind, &dependent.name, e)),
        }
    }

    fn write_failed(
        &self,
        primary: &DynamicObject,
        kind: &ResourceKind,
        name: &str,
        err: StoreError,
    ) -> Outcome {
        let message = format!("Failed to write {} {name}: {err}", kind.kind());
        self.record(primary, EventType::Warning, REASON_CREATE_FAILED, &message);
        if err.is_fatal() {
            Outcome::Invalid(message)
        } else {
            Outcome::Retry(message)
        }
    }
}
