//! Prometheus metrics for the controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `groupkind_reconcile_duration_seconds` (histogram): reconcile duration labeled by kind.
//! - `groupkind_reconcile_total` (counter): reconciles labeled by kind and outcome.
//! - `groupkind_workqueue_depth` (gauge): keys waiting in the queue.
//! - `groupkind_workqueue_adds_total` (counter): accepted adds per queue.
//! - `groupkind_workqueue_retries_total` (counter): rate-limited requeues per queue.
//! - `groupkind_cache_events_total` (counter): applied watch events labeled by kind and event.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    /// Primary kind, e.g. "App"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub kind: String,
    /// "success", "done", "retry", "conflict" or "invalid"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheEventLabels {
    pub kind: String,
    /// "added", "modified" or "deleted"
    pub event: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<KindLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static QUEUE_ADDS_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_RETRIES_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CACHE_EVENTS_TOTAL: Lazy<Family<CacheEventLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "groupkind_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "groupkind_reconcile",
        "Reconciles by outcome",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "groupkind_workqueue_depth",
        "Keys waiting to be reconciled",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "groupkind_workqueue_adds",
        "Keys accepted by the work queue",
        QUEUE_ADDS_TOTAL.clone(),
    );
    registry.register(
        "groupkind_workqueue_retries",
        "Keys requeued with backoff",
        QUEUE_RETRIES_TOTAL.clone(),
    );
    registry.register(
        "groupkind_cache_events",
        "Watch events applied to resource caches",
        CACHE_EVENTS_TOTAL.clone(),
    );

    registry
});

/// Record one finished reconcile.
pub fn observe_reconcile(kind: &str, outcome: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&KindLabels {
            kind: kind.to_string(),
        })
        .observe(seconds);
    RECONCILE_TOTAL
        .get_or_create(&OutcomeLabels {
            kind: kind.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn set_queue_depth(name: &str, depth: usize) {
    QUEUE_DEPTH
        .get_or_create(&QueueLabels {
            name: name.to_string(),
        })
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn record_queue_add(name: &str) {
    QUEUE_ADDS_TOTAL
        .get_or_create(&QueueLabels {
            name: name.to_string(),
        })
        .inc();
}

pub fn record_queue_retry(name: &str) {
    QUEUE_RETRIES_TOTAL
        .get_or_create(&QueueLabels {
            name: name.to_string(),
        })
        .inc();
}

pub fn record_cache_event(kind: &str, event: &str) {
    CACHE_EVENTS_TOTAL
        .get_or_create(&CacheEventLabels {
            kind: kind.to_string(),
            event: event.to_string(),
        })
        .inc();
}
