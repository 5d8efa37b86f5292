//! vncgate VNC Service Controller
//!
//! Watches VirtualMachineInstances and keeps a `<vmi>-vnc` NodePort Service
//! for each one that declares `directVNCAccess`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Service;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vncgate_controller::config::Config;
use vncgate_controller::service::managed_service_selector;
use vncgate_controller::{
    health, ApiClient, ControllerConfig, Informer, VirtualMachineInstance, VncServiceController,
};
use vncgate_reconcile::Cache;

/// Grace period for tasks to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        api_server_url = %config.api_server_url,
        workers = config.workers,
        health_listen_addr = %config.health_listen_addr,
        "Starting vncgate VNC service controller"
    );

    let token = config.read_token()?;
    if token.is_none() {
        warn!(path = %config.token_file.display(), "No API token found, sending unauthenticated requests");
    }
    let ca = config.read_ca()?;
    let client = Arc::new(
        ApiClient::new(config.api_server_url.clone(), token, ca.as_deref())
            .context("Failed to build API client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let vmi_cache = Arc::new(Cache::<VirtualMachineInstance>::new());
    let service_cache = Arc::new(Cache::<Service>::new());

    let controller = VncServiceController::new(
        client.clone(),
        Arc::clone(&vmi_cache),
        Arc::clone(&service_cache),
        ControllerConfig {
            workers: config.workers,
        },
    );

    let vmi_informer = tokio::spawn(
        Informer::new(Arc::clone(&client), vmi_cache).run(shutdown_rx.clone()),
    );
    let service_informer = tokio::spawn(
        Informer::new(Arc::clone(&client), service_cache)
            .with_label_selector(managed_service_selector())
            .run(shutdown_rx.clone()),
    );

    let listener = tokio::net::TcpListener::bind(config.health_listen_addr)
        .await
        .with_context(|| format!("Failed to bind health server on {}", config.health_listen_addr))?;
    let health_handle = tokio::spawn({
        let router = health::routes(Arc::clone(&controller));
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|down| *down).await;
                })
                .await
        }
    });

    let mut controller_handle = tokio::spawn(Arc::clone(&controller).run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
            warn!("Controller exited before shutdown was requested");
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for tasks to shut down...");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        if !controller_handle.is_finished() {
            let _ = controller_handle.await;
        }
        let _ = vmi_informer.await;
        let _ = service_informer.await;
        match health_handle.await {
            Ok(Err(e)) => error!(error = %e, "Health server error"),
            Err(e) => error!(error = %e, "Health server task panicked"),
            Ok(Ok(())) => {}
        }
    })
    .await;
    if drained.is_err() {
        warn!("Tasks did not stop within the grace period");
    }

    info!("VNC service controller shutdown complete");
    Ok(())
}
