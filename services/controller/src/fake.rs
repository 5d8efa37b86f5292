//! In-memory [`ServiceApi`] for tests and local development.
//!
//! Behaves like the API server for the four calls the controller makes:
//! uid and resource version assignment, `AlreadyExists` on duplicate create,
//! `Conflict` on a stale update, `NotFound` on missing objects. Every call
//! is recorded so tests can assert on exactly what was sent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use vncgate_reconcile::{Cache, ObjectKey};

use crate::client::{ApiError, ServiceApi};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Get(ObjectKey),
    Create(ObjectKey),
    Update(ObjectKey),
    Delete(ObjectKey),
}

impl ApiCall {
    /// Whether the call changes stored state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ApiCall::Get(_))
    }
}

/// API server stand-in holding Services in memory.
#[derive(Default)]
pub struct InMemoryServiceApi {
    services: Mutex<BTreeMap<ObjectKey, Service>>,
    calls: Mutex<Vec<ApiCall>>,
    mirror: Option<Arc<Cache<Service>>>,
    failures_left: AtomicU32,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryServiceApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every successful write to `cache` as a watch would.
    pub fn with_mirror(cache: Arc<Cache<Service>>) -> Self {
        Self {
            mirror: Some(cache),
            ..Self::default()
        }
    }

    /// Store a Service without recording a call, assigning identity if absent.
    pub fn seed(&self, mut service: Service) -> Service {
        let key = Self::key(&service.metadata.namespace.clone().unwrap_or_default(), &service);
        self.stamp(&mut service, true);
        lock(&self.services).insert(key, service.clone());
        if let Some(cache) = &self.mirror {
            cache.upsert(service.clone());
        }
        service
    }

    /// Current stored Service.
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.services)
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    /// Number of stored Services.
    pub fn len(&self) -> usize {
        lock(&self.services).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.calls).clone()
    }

    /// Calls that changed stored state.
    pub fn mutations(&self) -> Vec<ApiCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Fail the next `count` calls with a 500.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    fn key(namespace: &str, service: &Service) -> ObjectKey {
        ObjectKey::new(namespace, service.metadata.name.clone().unwrap_or_default())
    }

    fn record(&self, call: ApiCall) -> Result<(), ApiError> {
        lock(&self.calls).push(call);
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ApiError::Status {
                code: 500,
                reason: "InternalError".to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn stamp(&self, service: &mut Service, new_object: bool) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = &mut service.metadata;
        if new_object && meta.uid.is_none() {
            meta.uid = Some(format!("svc-uid-{id}"));
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        meta.resource_version = Some(id.to_string());
    }
}

#[async_trait]
impl ServiceApi for InMemoryServiceApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        let key = ObjectKey::new(namespace, name);
        self.record(ApiCall::Get(key.clone()))?;
        lock(&self.services)
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(key.to_string()))
    }

    async fn create(&self, namespace: &str, service: &Service) -> Result<Service, ApiError> {
        let key = Self::key(namespace, service);
        self.record(ApiCall::Create(key.clone()))?;

        let mut created = service.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = None;
        {
            let mut services = lock(&self.services);
            if services.contains_key(&key) {
                return Err(ApiError::AlreadyExists(key.to_string()));
            }
            self.stamp(&mut created, true);
            services.insert(key, created.clone());
        }

        if let Some(cache) = &self.mirror {
            cache.upsert(created.clone());
        }
        Ok(created)
    }

    async fn update(&self, namespace: &str, service: &Service) -> Result<Service, ApiError> {
        let key = Self::key(namespace, service);
        self.record(ApiCall::Update(key.clone()))?;

        let mut updated = service.clone();
        {
            let mut services = lock(&self.services);
            let Some(current) = services.get(&key) else {
                return Err(ApiError::NotFound(key.to_string()));
            };
            if let Some(sent) = &service.metadata.resource_version {
                if current.metadata.resource_version.as_ref() != Some(sent) {
                    return Err(ApiError::Conflict(key.to_string()));
                }
            }
            updated.metadata.uid = current.metadata.uid.clone();
            updated.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
            self.stamp(&mut updated, false);
            services.insert(key, updated.clone());
        }

        if let Some(cache) = &self.mirror {
            cache.upsert(updated.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let key = ObjectKey::new(namespace, name);
        self.record(ApiCall::Delete(key.clone()))?;

        let removed = lock(&self.services)
            .remove(&key)
            .ok_or_else(|| ApiError::NotFound(key.to_string()))?;

        if let Some(cache) = &self.mirror {
            cache.remove(removed);
        }
        Ok(())
    }
}
