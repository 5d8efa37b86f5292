//! In-memory resource cache with change notifications.
//!
//! A [`Cache`] mirrors one resource kind. Whatever drives it (a list/watch
//! informer in production, the test directly in unit tests) feeds it full
//! listings through [`Cache::replace`] and individual changes through
//! [`Cache::upsert`] / [`Cache::remove`]. Every change is turned into an
//! add, update or delete notification for the registered handlers.
//!
//! Deletions that are only noticed by a relist (the watch missed the delete)
//! are delivered as [`DeletedObject::Tombstone`]: the last known state is
//! stale and may be absent, so handlers must extract identity defensively.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{Metadata, Resource};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::key::ObjectKey;

/// How often [`wait_for_cache_sync`] re-checks the caches.
pub const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resource kinds the cache can mirror.
pub trait CachedResource:
    Metadata<Ty = ObjectMeta> + Resource + Clone + Send + Sync + 'static
{
}

impl<T> CachedResource for T where
    T: Metadata<Ty = ObjectMeta> + Resource + Clone + Send + Sync + 'static
{
}

/// Payload of a delete notification.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletedObject<K> {
    /// The object as it was when the delete was observed.
    Final(K),

    /// The delete was inferred from a relist; the final state is unknown.
    Tombstone {
        /// Key the object was stored under.
        key: String,
        /// Last state the cache held, if any.
        last_known: Option<K>,
    },
}

impl<K> DeletedObject<K> {
    /// The deleted object, if the notification carries one.
    pub fn object(&self) -> Option<&K> {
        match self {
            DeletedObject::Final(obj) => Some(obj),
            DeletedObject::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }
}

/// Receives change notifications from a [`Cache`].
///
/// Handlers run synchronously on the thread applying the change, in
/// delivery order, and must not block.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);

    fn on_update(&self, old: &K, new: &K);

    fn on_delete(&self, obj: &DeletedObject<K>);
}

/// Anything that can report whether its initial listing is complete.
pub trait HasSynced: Send + Sync {
    fn has_synced(&self) -> bool;
}

enum Notification<K> {
    Added(Arc<K>),
    Updated(Arc<K>, Arc<K>),
    Deleted(DeletedObject<K>),
}

/// Thread-safe mirror of one resource kind, keyed by namespace/name.
pub struct Cache<K> {
    objects: RwLock<BTreeMap<ObjectKey, Arc<K>>>,
    synced: AtomicBool,
    resource_version: RwLock<Option<String>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
}

impl<K: CachedResource> Cache<K> {
    /// Create an empty, unsynced cache.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            synced: AtomicBool::new(false),
            resource_version: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for subsequent changes.
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    /// Look up an object by key.
    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the cache holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last resource version observed through a listing or a change.
    pub fn resource_version(&self) -> Option<String> {
        self.resource_version
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Record a resource version without an object change (watch bookmarks).
    pub fn set_resource_version(&self, resource_version: impl Into<String>) {
        *self
            .resource_version
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(resource_version.into());
    }

    /// Replace the contents with a full listing and mark the cache synced.
    ///
    /// Keys that disappeared are delivered as tombstones.
    pub fn replace(&self, items: Vec<K>, resource_version: Option<String>) {
        let mut listed = BTreeMap::new();
        for item in items {
            match ObjectKey::from_meta(item.metadata()) {
                Ok(key) => {
                    listed.insert(key, Arc::new(item));
                }
                Err(e) => warn!(kind = K::KIND, error = %e, "Skipping listed object without identity"),
            }
        }

        let mut notifications = Vec::new();
        {
            let mut objects = self
                .objects
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let previous = std::mem::replace(&mut *objects, listed.clone());

            for (key, obj) in &listed {
                match previous.get(key) {
                    Some(old) => notifications.push(Notification::Updated(Arc::clone(old), Arc::clone(obj))),
                    None => notifications.push(Notification::Added(Arc::clone(obj))),
                }
            }

            for (key, old) in previous {
                if !listed.contains_key(&key) {
                    notifications.push(Notification::Deleted(DeletedObject::Tombstone {
                        key: key.to_string(),
                        last_known: Some(Arc::unwrap_or_clone(old)),
                    }));
                }
            }
        }

        if let Some(rv) = resource_version {
            self.set_resource_version(rv);
        }

        if !self.synced.swap(true, Ordering::SeqCst) {
            info!(kind = K::KIND, objects = listed.len(), "Cache synced");
        } else {
            debug!(kind = K::KIND, objects = listed.len(), "Cache relisted");
        }

        self.dispatch(notifications);
    }

    /// Insert or overwrite a single object.
    pub fn upsert(&self, obj: K) {
        let key = match ObjectKey::from_meta(obj.metadata()) {
            Ok(key) => key,
            Err(e) => {
                warn!(kind = K::KIND, error = %e, "Ignoring object without identity");
                return;
            }
        };
        let rv = obj.metadata().resource_version.clone();
        let obj = Arc::new(obj);

        let previous = self
            .objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, Arc::clone(&obj));

        if let Some(rv) = rv {
            self.set_resource_version(rv);
        }

        let notification = match previous {
            Some(old) => Notification::Updated(old, obj),
            None => Notification::Added(obj),
        };
        self.dispatch(vec![notification]);
    }

    /// Remove an object whose deletion was observed directly.
    pub fn remove(&self, obj: K) {
        let key = match ObjectKey::from_meta(obj.metadata()) {
            Ok(key) => key,
            Err(e) => {
                warn!(kind = K::KIND, error = %e, "Ignoring delete of object without identity");
                return;
            }
        };

        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key);

        if let Some(rv) = obj.metadata().resource_version.clone() {
            self.set_resource_version(rv);
        }

        self.dispatch(vec![Notification::Deleted(DeletedObject::Final(obj))]);
    }

    fn dispatch(&self, notifications: Vec<Notification<K>>) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if handlers.is_empty() {
            return;
        }

        for notification in &notifications {
            for handler in &handlers {
                match notification {
                    Notification::Added(obj) => handler.on_add(obj),
                    Notification::Updated(old, new) => handler.on_update(old, new),
                    Notification::Deleted(deleted) => handler.on_delete(deleted),
                }
            }
        }
    }
}

impl<K: CachedResource> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CachedResource> HasSynced for Cache<K> {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Block until every cache reports synced.
///
/// Returns `false` if shutdown was signalled (or its sender dropped) first.
pub async fn wait_for_cache_sync(
    shutdown: &mut watch::Receiver<bool>,
    caches: &[&dyn HasSynced],
) -> bool {
    let mut ticker = tokio::time::interval(CACHE_SYNC_POLL_INTERVAL);

    loop {
        if caches.iter().all(|c| c.has_synced()) {
            return true;
        }
        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_map(ns: &str, name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    fn name_of(cm: &ConfigMap) -> &str {
        cm.metadata.name.as_deref().unwrap_or("")
    }

    impl EventHandler<ConfigMap> for Recorder {
        fn on_add(&self, obj: &ConfigMap) {
            self.seen.lock().unwrap().push(format!("add {}", name_of(obj)));
        }

        fn on_update(&self, old: &ConfigMap, new: &ConfigMap) {
            self.seen.lock().unwrap().push(format!(
                "update {} {}->{}",
                name_of(new),
                old.metadata.resource_version.as_deref().unwrap_or(""),
                new.metadata.resource_version.as_deref().unwrap_or("")
            ));
        }

        fn on_delete(&self, obj: &DeletedObject<ConfigMap>) {
            let entry = match obj {
                DeletedObject::Final(cm) => format!("delete {}", name_of(cm)),
                DeletedObject::Tombstone { key, .. } => format!("tombstone {key}"),
            };
            self.seen.lock().unwrap().push(entry);
        }
    }

    #[test]
    fn test_replace_marks_synced_and_notifies() {
        let cache = Cache::<ConfigMap>::new();
        let recorder = Arc::new(Recorder::default());
        cache.add_event_handler(recorder.clone());

        assert!(!cache.has_synced());
        cache.replace(
            vec![config_map("ns", "a", "1"), config_map("ns", "b", "2")],
            Some("10".to_string()),
        );

        assert!(cache.has_synced());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.resource_version().as_deref(), Some("10"));
        assert_eq!(recorder.take(), vec!["add a", "add b"]);
    }

    #[test]
    fn test_relist_emits_updates_and_tombstones() {
        let cache = Cache::<ConfigMap>::new();
        let recorder = Arc::new(Recorder::default());
        cache.replace(
            vec![config_map("ns", "a", "1"), config_map("ns", "b", "2")],
            None,
        );
        cache.add_event_handler(recorder.clone());

        cache.replace(vec![config_map("ns", "a", "3")], Some("11".to_string()));

        assert_eq!(recorder.take(), vec!["update a 1->3", "tombstone ns/b"]);
        assert!(cache.get_by_key(&ObjectKey::new("ns", "b")).is_none());
    }

    #[test]
    fn test_upsert_and_remove() {
        let cache = Cache::<ConfigMap>::new();
        let recorder = Arc::new(Recorder::default());
        cache.add_event_handler(recorder.clone());

        cache.upsert(config_map("ns", "a", "1"));
        cache.upsert(config_map("ns", "a", "2"));
        cache.remove(config_map("ns", "a", "3"));

        assert_eq!(recorder.take(), vec!["add a", "update a 1->2", "delete a"]);
        assert!(cache.is_empty());
        assert_eq!(cache.resource_version().as_deref(), Some("3"));
    }

    #[test]
    fn test_objects_without_identity_are_ignored() {
        let cache = Cache::<ConfigMap>::new();
        cache.upsert(ConfigMap::default());
        cache.replace(vec![ConfigMap::default()], None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_tombstone_object_accessor() {
        let cm = config_map("ns", "a", "1");
        let tombstone = DeletedObject::Tombstone {
            key: "ns/a".to_string(),
            last_known: Some(cm.clone()),
        };
        assert_eq!(tombstone.object(), Some(&cm));

        let empty: DeletedObject<ConfigMap> = DeletedObject::Tombstone {
            key: "ns/a".to_string(),
            last_known: None,
        };
        assert!(empty.object().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync() {
        let cache = Arc::new(Cache::<ConfigMap>::new());
        let (_tx, mut rx) = watch::channel(false);

        let waiter = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { wait_for_cache_sync(&mut rx, &[&*cache]).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.replace(Vec::new(), None);

        let synced = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(synced);
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync_aborts_on_shutdown() {
        let cache = Cache::<ConfigMap>::new();
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        assert!(!wait_for_cache_sync(&mut rx, &[&cache]).await);
    }
}
