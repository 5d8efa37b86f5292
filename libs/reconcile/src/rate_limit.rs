//! Requeue rate limiting for the work queue.
//!
//! A [`RateLimiter`] decides how long a key must wait before it is handed
//! out again after a failed reconciliation. The default controller limiter
//! combines per-key exponential backoff with an overall token bucket, so a
//! single failing key backs off while a burst of distinct failures cannot
//! flood the storage API.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Base delay of the default per-key backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Maximum delay of the default per-key backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Sustained requeue rate of the default overall bucket.
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;

/// Burst size of the default overall bucket.
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// Decides requeue delays for keys.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be processed again. Counts as one failure.
    fn when(&self, key: &K) -> Duration;

    /// Clear all failure tracking for `key` (on success).
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialBackoff<K> {
    /// Create a limiter with the given base and maximum delays.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.min(63);
        let nanos = self.base.as_nanos().saturating_mul(1u128 << exp);
        if nanos >= self.max.as_nanos() {
            self.max
        } else {
            // Bounded by `max`, which fits in u64 nanoseconds.
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl<K> Default for ItemExponentialBackoff<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<K> RateLimiter<K> for ItemExponentialBackoff<K>
where
    K: Hash + Eq + Clone + Send,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all keys.
///
/// Every call to [`RateLimiter::when`] reserves one token; when the bucket
/// is empty the returned delay is the time until the reserved token refills.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second, holding `burst`.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_QPS, DEFAULT_BUCKET_BURST)
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Combines limiters, waiting for the slowest of them.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Create a combined limiter.
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Limiter used by controllers unless told otherwise: per-key exponential
/// backoff (5ms to 1000s) bounded by a 10 qps / 100 burst overall bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::<K>::default()),
        Box::new(BucketRateLimiter::default()),
    ])
}
