//! List/watch loop keeping a [`Cache`] in step with the API server.
//!
//! The informer lists once to seed the cache, then watches from the listed
//! resource version. A closed watch is reopened from the last version seen;
//! an expired version (410) forces a fresh list, whose differences reach
//! handlers as updates and tombstones.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::Metadata;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vncgate_reconcile::{Cache, CachedResource};

use crate::client::{ApiClient, ApiError, WatchEvent};

/// Pause before reopening a watch the server closed cleanly.
pub const WATCH_RESTART_DELAY: Duration = Duration::from_millis(100);

/// Exponential backoff for failed list and watch requests.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Upper bound on the delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

enum WatchOutcome {
    /// Reopen the watch from the current resource version.
    Rewatch,
    /// The resource version is no longer served; list again.
    Relist,
    Shutdown,
}

/// Feeds one [`Cache`] from list/watch calls for kind `K`.
pub struct Informer<K> {
    client: Arc<ApiClient>,
    cache: Arc<Cache<K>>,
    label_selector: Option<String>,
    backoff: BackoffPolicy,
}

impl<K> Informer<K>
where
    K: CachedResource + DeserializeOwned,
{
    pub fn new(client: Arc<ApiClient>, cache: Arc<Cache<K>>) -> Self {
        Self {
            client,
            cache,
            label_selector: None,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Only mirror objects matching `selector`.
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(kind = K::KIND, selector = ?self.label_selector, "Starting informer");
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let listed = tokio::select! {
                result = self.client.list::<K>(self.label_selector.as_deref()) => result,
                _ = shutdown.wait_for(|down| *down) => break,
            };

            let mut resource_version = match listed {
                Ok(list) => {
                    failures = 0;
                    let rv = list.metadata.resource_version.clone();
                    self.cache.replace(list.items, rv.clone());
                    rv.unwrap_or_default()
                }
                Err(e) => {
                    warn!(kind = K::KIND, error = %e, failures, "List failed, will retry");
                    if !self.pause(self.backoff.delay(failures), &mut shutdown).await {
                        break;
                    }
                    failures = failures.saturating_add(1);
                    continue;
                }
            };

            match self
                .watch_until_relist(&mut resource_version, &mut failures, &mut shutdown)
                .await
            {
                WatchOutcome::Relist => {
                    info!(kind = K::KIND, "Resource version expired, relisting");
                    if !self.pause(WATCH_RESTART_DELAY, &mut shutdown).await {
                        break;
                    }
                }
                WatchOutcome::Shutdown => break,
                WatchOutcome::Rewatch => {}
            }
        }

        info!(kind = K::KIND, "Informer stopped");
    }

    async fn watch_until_relist(
        &self,
        resource_version: &mut String,
        failures: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WatchOutcome {
        loop {
            let opened = tokio::select! {
                result = self.client.watch::<K>(resource_version.as_str(), self.label_selector.as_deref()) => result,
                _ = shutdown.wait_for(|down| *down) => return WatchOutcome::Shutdown,
            };

            let outcome = match opened {
                Ok(mut stream) => {
                    *failures = 0;
                    loop {
                        let next = tokio::select! {
                            next = stream.next_event() => next,
                            _ = shutdown.wait_for(|down| *down) => return WatchOutcome::Shutdown,
                        };

                        match next {
                            None => break WatchOutcome::Rewatch,
                            Some(Ok(event)) => {
                                if let Some(outcome) = self.apply(event, resource_version) {
                                    break outcome;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(kind = K::KIND, error = %e, "Watch stream failed");
                                break WatchOutcome::Rewatch;
                            }
                        }
                    }
                }
                Err(ApiError::Gone(_)) => WatchOutcome::Relist,
                Err(e) => {
                    warn!(kind = K::KIND, error = %e, failures = *failures, "Watch failed, will retry");
                    let delay = self.backoff.delay(*failures);
                    *failures = failures.saturating_add(1);
                    if !self.pause(delay, shutdown).await {
                        return WatchOutcome::Shutdown;
                    }
                    continue;
                }
            };

            match outcome {
                WatchOutcome::Rewatch => {
                    if !self.pause(WATCH_RESTART_DELAY, shutdown).await {
                        return WatchOutcome::Shutdown;
                    }
                }
                other => return other,
            }
        }
    }

    /// Apply one watch event. Returns an outcome when the watch must end.
    fn apply(&self, event: WatchEvent<K>, resource_version: &mut String) -> Option<WatchOutcome> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                if let Some(rv) = obj.metadata().resource_version.clone() {
                    *resource_version = rv;
                }
                self.cache.upsert(obj);
            }
            WatchEvent::Deleted(obj) => {
                if let Some(rv) = obj.metadata().resource_version.clone() {
                    *resource_version = rv;
                }
                self.cache.remove(obj);
            }
            WatchEvent::Bookmark(bookmark) => {
                debug!(kind = K::KIND, resource_version = %bookmark.metadata.resource_version, "Bookmark");
                *resource_version = bookmark.metadata.resource_version;
                self.cache.set_resource_version(resource_version.clone());
            }
            WatchEvent::Error(status) => {
                if status.code == Some(410) {
                    return Some(WatchOutcome::Relist);
                }
                warn!(
                    kind = K::KIND,
                    code = ?status.code,
                    reason = ?status.reason,
                    message = ?status.message,
                    "Watch returned an error"
                );
                return Some(WatchOutcome::Rewatch);
            }
        }
        None
    }

    /// Sleep for `delay`. Returns `false` if shutdown came first.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.wait_for(|down| *down) => false,
        }
    }
}
