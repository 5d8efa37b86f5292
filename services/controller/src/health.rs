//! Health check endpoints.
//!
//! Used by the kubelet probes. Readiness tracks cache sync: a controller
//! that has not finished its initial listing would act on partial state.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::controller::VncServiceController;

const SERVICE_NAME: &str = "vnc-controller";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "syncing".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub caches_synced: Option<bool>,

    /// Last VMI resource version observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_resource_version: Option<String>,
}

impl HealthResponse {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            caches_synced: None,
            last_resource_version: None,
        }
    }
}

/// Create health check routes.
pub fn routes(controller: Arc<VncServiceController>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .with_state(controller)
}

/// Process is up.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse::ok())
}

/// Ready once both caches have synced; 503 until then.
async fn readyz(State(controller): State<Arc<VncServiceController>>) -> impl IntoResponse {
    let synced = controller.has_synced();
    let response = HealthResponse {
        status: if synced { "ok" } else { "syncing" }.to_string(),
        caches_synced: Some(synced),
        last_resource_version: controller.last_sync_resource_version(),
        ..HealthResponse::ok()
    };

    let code = if synced {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use k8s_openapi::api::core::v1::Service;
    use tower::ServiceExt;
    use vncgate_reconcile::Cache;

    use crate::controller::ControllerConfig;
    use crate::fake::InMemoryServiceApi;
    use crate::vmi::VirtualMachineInstance;

    fn controller() -> (
        Arc<Cache<VirtualMachineInstance>>,
        Arc<Cache<Service>>,
        Arc<VncServiceController>,
    ) {
        let vmis = Arc::new(Cache::new());
        let services = Arc::new(Cache::new());
        let controller = VncServiceController::new(
            Arc::new(InMemoryServiceApi::new()),
            Arc::clone(&vmis),
            Arc::clone(&services),
            ControllerConfig::default(),
        );
        (vmis, services, controller)
    }

    async fn get(router: Router, path: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_livez_and_healthz() {
        let (_, _, controller) = controller();

        let (status, _) = get(routes(Arc::clone(&controller)), "/livez").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get(routes(controller), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.service, "vnc-controller");
    }

    #[tokio::test]
    async fn test_readyz_follows_cache_sync() {
        let (vmis, services, controller) = controller();

        let (status, body) = get(routes(Arc::clone(&controller)), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.caches_synced, Some(false));

        vmis.replace(Vec::new(), Some("17".to_string()));
        services.replace(Vec::new(), None);

        let (status, body) = get(routes(controller), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.caches_synced, Some(true));
        assert_eq!(health.last_resource_version.as_deref(), Some("17"));
    }
}
