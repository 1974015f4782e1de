//! Event recording for primary resources
//!
//! Recording is fire-and-forget: a recorder never blocks a reconcile and
//! its failures never change the outcome.

use std::fmt;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, PostParams};
use kube::core::DynamicObject;
use kube::Client;
use tracing::{debug, info, warn};

use crate::controller::queue::lock;
use crate::registry::ResourceKind;

pub const REASON_SYNCED: &str = "Synced";
pub const REASON_RESOURCE_EXISTS: &str = "ErrResourceExists";
pub const REASON_CREATE_FAILED: &str = "ErrCreateFailed";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

pub const MESSAGE_SYNCED: &str = "App synced successfully";

/// Message for a dependent that exists but is controlled by someone else
pub fn resource_exists_message(name: &str) -> String {
    format!("Resource {name:?} already exists and is not managed by App")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to `object` suitable for `Event.involvedObject`
pub fn object_reference(object: &DynamicObject, kind: &ResourceKind) -> ObjectReference {
    ObjectReference {
        api_version: Some(kind.api_version().to_string()),
        kind: Some(kind.kind().to_string()),
        namespace: object.metadata.namespace.clone(),
        name: object.metadata.name.clone(),
        uid: object.metadata.uid.clone(),
        resource_version: object.metadata.resource_version.clone(),
        ..Default::default()
    }
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Writes core/v1 Events through the API server
pub struct KubeEventRecorder {
    client: Client,
    component: String,
    host: Option<String>,
}

impl KubeEventRecorder {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok());
        Self {
            client,
            component: component.into(),
            host,
        }
    }

    fn build(
        &self,
        object: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Event {
        let time = Time(chrono::Utc::now());
        Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!(
                    "{}-",
                    object.name.as_deref().unwrap_or("unknown")
                )),
                namespace: object.namespace.clone(),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: object.clone(),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: self.host.clone(),
            }),
            reporting_component: Some(self.component.clone()),
            reporting_instance: self.host.clone(),
            first_timestamp: Some(time.clone()),
            last_timestamp: Some(time),
            count: Some(1),
            ..Default::default()
        }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let namespace = object.namespace.clone().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        let event = self.build(object, event_type, reason, message);
        let reason = reason.to_string();

        tokio::spawn(async move {
            match events.create(&PostParams::default(), &event).await {
                Ok(_) => debug!(%reason, "event recorded"),
                Err(e) => warn!(%reason, error = %e, "failed to record event"),
            }
        });
    }
}

/// Logs events instead of persisting them
#[derive(Clone, Copy, Debug, Default)]
pub struct LogEventRecorder;

impl EventRecorder for LogEventRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let name = object.name.as_deref().unwrap_or_default();
        let namespace = object.namespace.as_deref().unwrap_or_default();
        match event_type {
            EventType::Normal => info!(namespace, name, reason, note = message, "event"),
            EventType::Warning => warn!(namespace, name, reason, note = message, "event"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory for inspection
#[derive(Debug, Default)]
pub struct InMemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            namespace: object.namespace.clone(),
            name: object.name.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
