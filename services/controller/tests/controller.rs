//! Reconciliation scenarios against the in-memory Service API.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio::sync::watch;
use vncgate_controller::service::{
    desired_service, ANNOTATION_VNC_PORT, LABEL_CREATED_BY, LABEL_VMI,
};
use vncgate_controller::vmi::VirtualMachineInstanceSpec;
use vncgate_controller::{
    ApiCall, ControllerConfig, ControllerError, DirectVncAccess, InMemoryServiceApi,
    VirtualMachineInstance, VncServiceController,
};
use vncgate_reconcile::{Cache, ObjectKey};

struct Harness {
    vmis: Arc<Cache<VirtualMachineInstance>>,
    services: Arc<Cache<Service>>,
    api: Arc<InMemoryServiceApi>,
    controller: Arc<VncServiceController>,
}

impl Harness {
    /// Controller whose Service cache sees every write, like a live watch.
    fn mirrored() -> Self {
        let services = Arc::new(Cache::new());
        let api = Arc::new(InMemoryServiceApi::with_mirror(Arc::clone(&services)));
        Self::build(api, services)
    }

    /// Controller whose Service cache never sees writes.
    fn unmirrored() -> Self {
        Self::build(Arc::new(InMemoryServiceApi::new()), Arc::new(Cache::new()))
    }

    fn build(api: Arc<InMemoryServiceApi>, services: Arc<Cache<Service>>) -> Self {
        let vmis = Arc::new(Cache::new());
        let controller = VncServiceController::new(
            api.clone(),
            Arc::clone(&vmis),
            Arc::clone(&services),
            ControllerConfig { workers: 2 },
        );
        vmis.replace(Vec::new(), Some("1".to_string()));
        services.replace(Vec::new(), Some("1".to_string()));

        Self {
            vmis,
            services,
            api,
            controller,
        }
    }

    /// Process queued keys until none are left.
    async fn drain(&self) {
        while !self.controller.queue().is_empty() {
            self.controller.process_next_work_item().await;
        }
    }

    fn vnc_service(&self) -> Option<Service> {
        self.api.service("ns", "vm1-vnc")
    }
}

fn vmi(rv: &str, access: Option<DirectVncAccess>) -> VirtualMachineInstance {
    VirtualMachineInstance {
        metadata: ObjectMeta {
            name: Some("vm1".to_string()),
            namespace: Some("ns".to_string()),
            uid: Some("u1".to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        spec: VirtualMachineInstanceSpec {
            direct_vnc_access: access,
        },
    }
}

fn with_port(port: Option<i32>) -> Option<DirectVncAccess> {
    Some(DirectVncAccess { port })
}

fn key() -> ObjectKey {
    ObjectKey::new("ns", "vm1")
}

fn service_port(service: &Service) -> i32 {
    service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port
}

async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_declaration_creates_service() {
    let h = Harness::mirrored();

    h.vmis.upsert(vmi("2", with_port(None)));
    h.drain().await;

    let svc = h.vnc_service().expect("service created");
    assert_eq!(service_port(&svc), 5900);
    let spec = svc.spec.as_ref().unwrap();
    assert_eq!(spec.type_.as_deref(), Some("NodePort"));
    assert_eq!(spec.selector.as_ref().unwrap()[LABEL_CREATED_BY], "u1");
    assert_eq!(
        spec.ports.as_ref().unwrap()[0].target_port,
        Some(IntOrString::Int(5900))
    );
    assert_eq!(svc.metadata.labels.as_ref().unwrap()[LABEL_VMI], "vm1");
    let owner = &svc.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!((owner.kind.as_str(), owner.uid.as_str()), ("VirtualMachineInstance", "u1"));

    assert_eq!(h.api.mutations(), vec![ApiCall::Create(ObjectKey::new("ns", "vm1-vnc"))]);
}

#[tokio::test]
async fn test_port_change_updates_in_place() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", with_port(None)));
    h.drain().await;
    let created = h.vnc_service().unwrap();

    h.vmis.upsert(vmi("3", with_port(Some(5901))));
    h.drain().await;

    let updated = h.vnc_service().unwrap();
    assert_eq!(service_port(&updated), 5901);
    assert_eq!(updated.metadata.uid, created.metadata.uid);
    assert_eq!(
        updated.metadata.annotations.as_ref().unwrap()[ANNOTATION_VNC_PORT],
        "5901"
    );
    assert_eq!(
        h.api.mutations().last(),
        Some(&ApiCall::Update(ObjectKey::new("ns", "vm1-vnc")))
    );
}

#[tokio::test]
async fn test_vmi_deletion_removes_service() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", with_port(None)));
    h.drain().await;

    h.vmis.remove(vmi("3", with_port(None)));
    h.drain().await;

    assert!(h.vnc_service().is_none());
    assert!(h.services.is_empty());
}

#[tokio::test]
async fn test_withdrawn_declaration_removes_service() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", with_port(None)));
    h.drain().await;

    h.vmis.upsert(vmi("3", None));
    h.drain().await;

    assert!(h.vnc_service().is_none());
    assert!(h.api.is_empty());
}

#[tokio::test]
async fn test_relist_tombstone_removes_service() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", with_port(None)));
    h.drain().await;

    // A relist that no longer contains the VMI: the delete was missed.
    h.vmis.replace(Vec::new(), Some("9".to_string()));
    h.drain().await;

    assert!(h.vnc_service().is_none());
}

#[tokio::test]
async fn test_repeated_sync_is_idempotent() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", with_port(Some(5902))));
    h.drain().await;
    h.api.clear_calls();

    h.controller.sync(&key()).await.unwrap();
    h.controller.sync(&key()).await.unwrap();

    assert!(h.api.calls().is_empty(), "unexpected calls: {:?}", h.api.calls());
}

#[tokio::test]
async fn test_repeated_enqueues_collapse_to_one_sync() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", with_port(None)));
    for _ in 0..10 {
        h.controller.enqueue(key());
    }

    assert_eq!(h.controller.queue().len(), 1);
    h.drain().await;
    assert_eq!(h.api.mutations(), vec![ApiCall::Create(ObjectKey::new("ns", "vm1-vnc"))]);
}

#[tokio::test]
async fn test_vmi_without_declaration_is_not_enqueued() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", None));
    h.vmis.upsert(vmi("3", None));
    assert!(h.controller.queue().is_empty());
}

#[tokio::test]
async fn test_unchanged_resource_version_is_ignored() {
    let h = Harness::mirrored();
    h.vmis.upsert(vmi("2", with_port(None)));
    h.drain().await;

    h.vmis.upsert(vmi("2", with_port(None)));
    assert!(h.controller.queue().is_empty());

    // Same objects redelivered by a relist.
    h.vmis.replace(vec![vmi("2", with_port(None))], Some("2".to_string()));
    assert!(h.controller.queue().is_empty());
}

#[tokio::test]
async fn test_missing_vmi_without_service_is_ok() {
    let h = Harness::mirrored();
    h.controller.sync(&key()).await.unwrap();
    assert_eq!(h.api.calls(), vec![ApiCall::Delete(ObjectKey::new("ns", "vm1-vnc"))]);
}

#[tokio::test]
async fn test_service_missing_from_cache_is_read_from_api() {
    let h = Harness::unmirrored();
    let stale = vmi("1", with_port(None));
    h.api.seed(desired_service(&stale, &DirectVncAccess::default()).unwrap());

    h.vmis.upsert(vmi("2", with_port(Some(5905))));
    h.drain().await;

    let service_key = ObjectKey::new("ns", "vm1-vnc");
    assert_eq!(
        h.api.calls(),
        vec![ApiCall::Get(service_key.clone()), ApiCall::Update(service_key)]
    );
    assert_eq!(service_port(&h.vnc_service().unwrap()), 5905);
}

#[tokio::test]
async fn test_invalid_vmi_is_reported() {
    let h = Harness::mirrored();
    let mut broken = vmi("2", with_port(None));
    broken.metadata.uid = None;
    h.vmis.upsert(broken);

    let err = h.controller.sync(&key()).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidObject { .. }), "{err}");
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_vmi_is_not_requeued() {
    let h = Harness::mirrored();
    let mut broken = vmi("2", with_port(None));
    broken.metadata.uid = None;
    h.vmis.upsert(broken);
    assert_eq!(h.controller.queue().len(), 1);

    assert!(h.controller.process_next_work_item().await);

    assert!(h.controller.queue().is_empty());
    assert_eq!(h.controller.queue().num_requeues(&key()), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.controller.queue().is_empty());
    assert!(h.api.calls().is_empty());

    // Fixing the object enqueues it again through the update notification.
    h.vmis.upsert(vmi("3", with_port(None)));
    h.drain().await;
    assert!(h.vnc_service().is_some());
}

#[tokio::test]
async fn test_failed_sync_is_retried() {
    let h = Harness::mirrored();
    h.api.fail_next(2);
    h.vmis.upsert(vmi("2", with_port(None)));

    let controller = Arc::clone(&h.controller);
    let worker = tokio::spawn(async move { while controller.process_next_work_item().await {} });

    eventually(|| h.vnc_service().is_some()).await;
    eventually(|| h.controller.queue().num_requeues(&key()) == 0).await;
    assert_eq!(h.api.mutations().len(), 1);

    h.controller.queue().shut_down();
    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_run_reconciles_until_shutdown() {
    let h = Harness::mirrored();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&h.controller).run(shutdown_rx));

    h.vmis.upsert(vmi("2", with_port(Some(5999))));
    eventually(|| h.vnc_service().is_some()).await;
    assert_eq!(service_port(&h.vnc_service().unwrap()), 5999);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("controller did not stop")
        .unwrap();
    assert!(h.controller.queue().is_shutting_down());
}

#[tokio::test]
async fn test_run_exits_if_shutdown_precedes_sync() {
    let api = Arc::new(InMemoryServiceApi::new());
    let controller = VncServiceController::new(
        api,
        Arc::new(Cache::new()),
        Arc::new(Cache::new()),
        ControllerConfig::default(),
    );
    assert!(!controller.has_synced());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&controller).run(shutdown_rx));
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("controller did not stop")
        .unwrap();
    assert!(controller.queue().is_shutting_down());
}

#[tokio::test]
async fn test_last_sync_resource_version_tracks_vmi_cache() {
    let h = Harness::mirrored();
    assert_eq!(h.controller.last_sync_resource_version().as_deref(), Some("1"));

    h.vmis.upsert(vmi("42", None));
    assert_eq!(h.controller.last_sync_resource_version().as_deref(), Some("42"));
}
