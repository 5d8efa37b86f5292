//! Deduplicating, rate-limited work queue.
//!
//! The queue converts edge-triggered notifications into level-triggered
//! work. Its invariants:
//!
//! - A key is pending at most once: adding a key that is already queued is
//!   a no-op, so repeated notifications for an unprocessed key collapse.
//! - A key is processed by at most one worker at a time: a key added while
//!   it is being processed is marked dirty and re-queued when the worker
//!   calls [`WorkQueue::done`], never handed to a second worker.
//! - After [`WorkQueue::shut_down`], adds are ignored and [`WorkQueue::get`]
//!   returns `None` once the pending keys are drained.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use crate::rate_limit::{default_controller_rate_limiter, RateLimiter};

/// Bounds required of queue keys.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}

struct QueueState<K> {
    /// Keys waiting to be handed out, in arrival order.
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while processing).
    dirty: HashSet<K>,
    /// Keys currently held by a worker.
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

impl<K> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A named work queue shared between event handlers and workers.
///
/// Cloning yields another handle to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue using the default controller rate limiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    /// Create a queue with a custom requeue rate limiter.
    pub fn with_rate_limiter(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown_tx,
                rate_limiter,
            }),
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.inner.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(queue = %self.inner.name, key = ?key, "Key in flight, marked dirty");
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. Dropped if the queue shuts down first.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = shutdown_rx.wait_for(|down| *down) => {}
            }
        });
    }

    /// Add `key` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        debug!(
            queue = %self.inner.name,
            key = ?key,
            delay_ms = delay.as_millis() as u64,
            "Requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Stop tracking failures for `key`.
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down and no keys remain. The
    /// caller must call [`WorkQueue::done`] with the key when finished.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `key` finished, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake all waiting workers.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        self.inner.shutdown_tx.send_replace(true);
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "Work queue shut down");
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
