//! VNC exposure controller.
//!
//! Watches VirtualMachineInstances through a [`Cache`] and converges one
//! NodePort Service per instance that declares `directVNCAccess`:
//!
//! - Declaration present: the `<vmi>-vnc` Service exists with the declared
//!   (or default) port and selects the instance's pods by uid
//! - Declaration absent or instance gone: the Service does not exist
//!
//! Notifications only enqueue keys. Workers re-read current state on every
//! pass, so repeated or dropped notifications never leave lasting drift.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn, Instrument};
use vncgate_reconcile::{
    wait_for_cache_sync, Cache, DeletedObject, EventHandler, HasSynced, ObjectKey, WorkQueue,
};

use crate::client::ServiceApi;
use crate::error::Result;
use crate::service::{desired_service, updated_service, vnc_service_name};
use crate::vmi::{DirectVncAccess, VirtualMachineInstance};

/// Name of the controller's work queue.
pub const QUEUE_NAME: &str = "vmi-vnc-service";

/// Worker count used when none is configured.
pub const DEFAULT_WORKERS: usize = 3;

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Maps VMI notifications to queue keys.
struct VmiEventHandler {
    queue: WorkQueue<ObjectKey>,
}

impl VmiEventHandler {
    fn enqueue(&self, vmi: &VirtualMachineInstance) {
        match ObjectKey::from_meta(&vmi.metadata) {
            Ok(key) => self.queue.add(key),
            Err(e) => error!(error = %e, "Cannot derive key for VirtualMachineInstance"),
        }
    }
}

impl EventHandler<VirtualMachineInstance> for VmiEventHandler {
    fn on_add(&self, vmi: &VirtualMachineInstance) {
        if vmi.wants_direct_vnc() {
            debug!(name = ?vmi.metadata.name, "VMI with direct VNC access added");
            self.enqueue(vmi);
        }
    }

    fn on_update(&self, old: &VirtualMachineInstance, new: &VirtualMachineInstance) {
        // Periodic relists redeliver unchanged objects.
        if old.metadata.resource_version == new.metadata.resource_version {
            return;
        }
        if old.wants_direct_vnc() || new.wants_direct_vnc() {
            debug!(name = ?new.metadata.name, "VMI with direct VNC access updated");
            self.enqueue(new);
        }
    }

    fn on_delete(&self, deleted: &DeletedObject<VirtualMachineInstance>) {
        match deleted.object() {
            Some(vmi) => {
                debug!(name = ?vmi.metadata.name, "VMI deleted");
                self.enqueue(vmi);
            }
            None => {
                let DeletedObject::Tombstone { key, .. } = deleted else {
                    return;
                };
                match key.parse::<ObjectKey>() {
                    Ok(key) => {
                        debug!(key = %key, "VMI deleted, final state unknown");
                        self.queue.add(key);
                    }
                    Err(e) => error!(key = %key, error = %e, "Cannot derive key from tombstone, dropping"),
                }
            }
        }
    }
}

/// Reconciles `<vmi>-vnc` Services against VirtualMachineInstances.
pub struct VncServiceController {
    api: Arc<dyn ServiceApi>,
    vmi_cache: Arc<Cache<VirtualMachineInstance>>,
    service_cache: Arc<Cache<Service>>,
    queue: WorkQueue<ObjectKey>,
    config: ControllerConfig,
}

impl VncServiceController {
    /// Create the controller and subscribe it to `vmi_cache`.
    pub fn new(
        api: Arc<dyn ServiceApi>,
        vmi_cache: Arc<Cache<VirtualMachineInstance>>,
        service_cache: Arc<Cache<Service>>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Self::with_queue(api, vmi_cache, service_cache, config, WorkQueue::new(QUEUE_NAME))
    }

    /// Like [`VncServiceController::new`] with a caller-supplied queue.
    pub fn with_queue(
        api: Arc<dyn ServiceApi>,
        vmi_cache: Arc<Cache<VirtualMachineInstance>>,
        service_cache: Arc<Cache<Service>>,
        config: ControllerConfig,
        queue: WorkQueue<ObjectKey>,
    ) -> Arc<Self> {
        vmi_cache.add_event_handler(Arc::new(VmiEventHandler {
            queue: queue.clone(),
        }));

        Arc::new(Self {
            api,
            vmi_cache,
            service_cache,
            queue,
            config,
        })
    }

    /// The controller's work queue.
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Schedule reconciliation of `key`.
    pub fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    /// Whether both caches have completed their initial listing.
    pub fn has_synced(&self) -> bool {
        self.vmi_cache.has_synced() && self.service_cache.has_synced()
    }

    /// Last VMI resource version the cache observed.
    pub fn last_sync_resource_version(&self) -> Option<String> {
        self.vmi_cache.resource_version()
    }

    /// Run workers until shutdown is signalled.
    ///
    /// Waits for both caches to sync first; returns without starting
    /// workers if shutdown arrives before that.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.config.workers, "Starting VNC service controller");

        let synced =
            wait_for_cache_sync(&mut shutdown, &[&*self.vmi_cache, &*self.service_cache]).await;
        if !synced {
            warn!("Shutdown requested before caches synced");
            self.queue.shut_down();
            return;
        }
        info!("Caches synced, starting workers");

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let controller = Arc::clone(&self);
            workers.spawn(
                async move { while controller.process_next_work_item().await {} }
                    .instrument(tracing::info_span!("worker", id)),
            );
        }

        let _ = shutdown.wait_for(|down| *down).await;
        info!("Stopping VNC service controller");
        self.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("VNC service controller stopped");
    }

    /// Process one key from the queue.
    ///
    /// Returns `false` once the queue has shut down and drained.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.sync(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) if !e.is_retryable() => {
                error!(key = %key, error = %e, "Cannot sync VNC service, dropping key");
                self.queue.forget(&key);
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    retries = self.queue.num_requeues(&key),
                    "Failed to sync VNC service, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }

    /// Converge the VNC Service of the VMI identified by `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn sync(&self, key: &ObjectKey) -> Result<()> {
        let Some(vmi) = self.vmi_cache.get_by_key(key) else {
            debug!("VMI no longer exists");
            return self.delete_vnc_service(&key.namespace, &key.name).await;
        };

        match vmi.spec.direct_vnc_access.as_ref() {
            Some(access) => self.create_or_update_vnc_service(key, &vmi, access).await,
            None => self.delete_vnc_service(&key.namespace, &key.name).await,
        }
    }

    async fn create_or_update_vnc_service(
        &self,
        key: &ObjectKey,
        vmi: &VirtualMachineInstance,
        access: &DirectVncAccess,
    ) -> Result<()> {
        let desired = desired_service(vmi, access)?;
        let namespace = key.namespace.as_str();
        let name = vnc_service_name(&key.name);

        let observed = match self
            .service_cache
            .get_by_key(&ObjectKey::new(namespace, name.as_str()))
        {
            Some(cached) => Some(Arc::unwrap_or_clone(cached)),
            None => match self.api.get(namespace, &name).await {
                Ok(service) => Some(service),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            },
        };

        match observed {
            None => {
                self.api.create(namespace, &desired).await?;
                info!(service = %name, port = access.effective_port(), "Created VNC service");
            }
            Some(observed) => match updated_service(&observed, &desired) {
                Some(updated) => {
                    self.api.update(namespace, &updated).await?;
                    info!(service = %name, port = access.effective_port(), "Updated VNC service");
                }
                None => debug!(service = %name, "VNC service up to date"),
            },
        }
        Ok(())
    }

    async fn delete_vnc_service(&self, namespace: &str, vmi_name: &str) -> Result<()> {
        let name = vnc_service_name(vmi_name);
        match self.api.delete(namespace, &name).await {
            Ok(()) => {
                info!(service = %name, "Deleted VNC service");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(service = %name, "VNC service already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
