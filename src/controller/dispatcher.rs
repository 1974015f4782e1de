//! Worker pool draining the work queue
//!
//! Keys derived by the caches are forwarded into the [`WorkQueue`]; a
//! fixed number of workers take keys off it and reconcile them. The
//! queue never hands the same key to two workers, so workers need no
//! further coordination.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::key::ObjectKey;
use super::queue::WorkQueue;
use super::reconciler::{Outcome, QueueAction, ReconcileEngine};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Something that reconciles a key
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &str) -> Outcome;
}

#[async_trait]
impl Reconcile for ReconcileEngine {
    async fn reconcile(&self, key: &str) -> Outcome {
        ReconcileEngine::reconcile(self, key).await
    }
}

/// Move derived keys into the queue until the senders are gone or
/// `shutdown` fires
pub async fn forward(
    queue: Arc<WorkQueue>,
    mut keys: mpsc::UnboundedReceiver<ObjectKey>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            key = keys.recv() => match key {
                Some(key) => queue.add(&key.to_string()),
                None => break,
            },
        }
    }
    debug!(queue = %queue.name(), "forwarder stopped");
}

pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
    workers: usize,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>, workers: usize) -> Self {
        Self {
            queue,
            reconciler,
            workers: workers.max(1),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// How long in-flight reconciles may run after shutdown
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Run the workers until `shutdown` fires, then drain
    pub async fn run(self, shutdown: CancellationToken) {
        info!(workers = self.workers, queue = %self.queue.name(), "starting workers");

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(worker(id, self.queue.clone(), self.reconciler.clone()));
        }

        // workers also stop if the queue is shut down elsewhere
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = join_all(&mut workers) => {}
        }

        info!("shutting down workers");
        self.queue.shut_down();
        if tokio::time::timeout(self.shutdown_grace, join_all(&mut workers))
            .await
            .is_err()
        {
            warn!(grace = ?self.shutdown_grace, "workers did not finish in time, aborting");
            workers.abort_all();
            join_all(&mut workers).await;
        }
        info!("workers stopped");
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "worker panicked");
            }
        }
    }
}

async fn worker(id: usize, queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let outcome = AssertUnwindSafe(reconciler.reconcile(&key))
            .catch_unwind()
            .await;

        match outcome {
            Ok(outcome) => match outcome.action() {
                QueueAction::Forget | QueueAction::Drop => queue.forget(&key),
                QueueAction::Requeue => queue.add_rate_limited(&key),
            },
            Err(_) => {
                error!(worker = id, %key, "reconcile panicked");
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
