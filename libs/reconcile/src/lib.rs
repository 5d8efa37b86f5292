//! Reconciliation loop primitives.
//!
//! This library provides the pieces a controller needs to converge derived
//! objects to the state of an authoritative object:
//!
//! - **Keys** ([`ObjectKey`]): `(namespace, name)` identity of one unit of work.
//! - **Cache** ([`Cache`]): an eventually-consistent mirror of a resource kind
//!   that turns changes into add/update/delete notifications.
//! - **Work queue** ([`WorkQueue`]): deduplicates keys, serializes work per
//!   key, and requeues failures with rate-limited backoff.
//!
//! # Invariants
//!
//! - A key is pending at most once and in flight in at most one worker
//! - Reconciliation reads current state, so lost or repeated notifications
//!   never cause permanent divergence
//! - Failures are retried by requeueing, never by looping inside a sync

mod cache;
mod key;
mod queue;
mod rate_limit;

pub use cache::{
    wait_for_cache_sync, Cache, CachedResource, DeletedObject, EventHandler, HasSynced,
    CACHE_SYNC_POLL_INTERVAL,
};
pub use key::{KeyError, ObjectKey};
pub use queue::{QueueKey, WorkQueue};
pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialBackoff, MaxOfRateLimiter,
    RateLimiter, DEFAULT_BASE_DELAY, DEFAULT_BUCKET_BURST, DEFAULT_BUCKET_QPS, DEFAULT_MAX_DELAY,
};
