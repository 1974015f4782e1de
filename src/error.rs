//! Error types for the controller
//!
//! `Error` is the crate-wide error. Store failures keep their own
//! classification in [`StoreError`](crate::store::StoreError) so the
//! reconcile engine can decide between retrying and dropping a key.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    #[error("Unknown resource kind: {0}")]
    UnknownKind(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cache for {kind} has not synced yet")]
    CacheNotSynced { kind: String },

    #[error("Cache for {kind} failed to sync: {reason}")]
    CacheSync { kind: String, reason: String },

    #[error("Timed out after {0:?} waiting for caches to sync")]
    SyncTimeout(Duration),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether retrying the failed operation can plausibly succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) => true,
            Error::Store(e) => !e.is_fatal(),
            Error::CacheNotSynced { .. } => true,
            Error::SerializationError(_)
            | Error::InvalidKey(_)
            | Error::UnknownKind(_)
            | Error::ValidationError(_)
            | Error::CacheSync { .. }
            | Error::SyncTimeout(_)
            | Error::ConfigError(_) => false,
        }
    }
}
