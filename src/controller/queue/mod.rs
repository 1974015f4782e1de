//! Deduplicating, rate-limited work queue
//!
//! A key is in at most one of three places: pending (`queue` + `dirty`),
//! in flight (`processing`), or both when it was re-added while a worker
//! held it. In the last case it is only put back on the queue by
//! [`WorkQueue::done`], so no two workers ever hold the same key.

mod rate_limiter;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter, DEFAULT_BASE_DELAY,
    DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS, MAX_BUCKET_DELAY, MIN_QPS,
};

/// Lock ignoring poisoning; every critical section leaves the state consistent
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
    drained: Notify,
    limiter: Box<dyn RateLimiter>,
    delayed: mpsc::UnboundedSender<(String, Instant)>,
}

impl WorkQueue {
    /// Create a queue and start its delay timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter + 'static) -> Arc<Self> {
        let (delayed, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            drained: Notify::new(),
            limiter: Box::new(limiter),
            delayed,
        });
        tokio::spawn(run_delays(Arc::downgrade(&queue), rx));
        queue
    }

    pub fn with_default_limiter(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    /// Queue `key` unless it is already pending.
    ///
    /// A key added while in flight is remembered and handed out again
    /// after `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.to_string()) {
            return;
        }

        #[cfg(feature = "metrics")]
        super::metrics::record_queue_add(&self.name);

        if state.processing.contains(key) {
            trace!(queue = %self.name, key, "in flight, deferring");
            return;
        }
        state.queue.push_back(key.to_string());
        #[cfg(feature = "metrics")]
        super::metrics::set_queue_depth(&self.name, state.queue.len());
        drop(state);
        self.available.notify_one();
    }

    /// Wait for the next key; `None` once shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    #[cfg(feature = "metrics")]
                    super::metrics::set_queue_depth(&self.name, state.queue.len());
                    if !state.queue.is_empty() {
                        // hand the remaining work to another waiter
                        self.available.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer in flight
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);

        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            #[cfg(feature = "metrics")]
            super::metrics::set_queue_depth(&self.name, state.queue.len());
            self.available.notify_one();
        }
        if state.processing.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Queue `key` once `delay` has elapsed
    pub fn add_after(&self, key: &str, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        // the timer only stops when the queue is dropped
        let _ = self.delayed.send((key.to_string(), Instant::now() + delay));
    }

    /// Queue `key` after its backoff delay
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.limiter.when(key);
        debug!(queue = %self.name, key, ?delay, "requeue with backoff");
        #[cfg(feature = "metrics")]
        super::metrics::record_queue_retry(&self.name);
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Pending keys, excluding those in flight or waiting on a delay
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Stop accepting keys; `get` returns the remaining keys, then `None`
    pub fn shut_down(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        let idle = state.processing.is_empty();
        drop(state);

        self.available.notify_waiters();
        if idle {
            self.drained.notify_waiters();
        }
    }

    /// Shut down and wait until no key is in flight
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.state().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

/// Hold delayed keys until their deadline. An earlier deadline for a
/// key replaces a later one.
async fn run_delays(
    queue: Weak<WorkQueue>,
    mut rx: mpsc::UnboundedReceiver<(String, Instant)>,
) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64, String)>> = BinaryHeap::new();
    let mut deadlines: HashMap<String, Instant> = HashMap::new();
    let mut seq = 0u64;

    loop {
        let next = heap.peek().map(|Reverse((at, _, _))| *at);
        let wake_at = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            msg = rx.recv() => {
                let Some((key, at)) = msg else { return };
                if deadlines.get(&key).map_or(true, |current| at < *current) {
                    deadlines.insert(key.clone(), at);
                    heap.push(Reverse((at, seq, key)));
                    seq += 1;
                }
            }
            _ = sleep_until(wake_at), if next.is_some() => {
                let Some(queue) = queue.upgrade() else { return };
                let now = Instant::now();
                while heap.peek().is_some_and(|Reverse((at, _, _))| *at <= now) {
                    let Some(Reverse((at, _, key))) = heap.pop() else { break };
                    // superseded entries are skipped
                    if deadlines.get(&key) == Some(&at) {
                        deadlines.remove(&key);
                        queue.add(&key);
                    }
                }
            }
        }
    }
}
