//! vncgate VNC Proxy
//!
//! Listens for VNC clients over TCP and forwards each connection to the
//! virtual machine's local VNC socket until interrupted.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vncgate_proxy::{Config, VncProxy};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to VNC_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        socket = %config.proxy.socket_path.display(),
        port = config.proxy.port,
        bind_addrs = ?config.proxy.bind_addrs,
        "Starting vncgate VNC proxy"
    );

    let proxy = VncProxy::new(config.proxy);
    proxy.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    proxy.stop().await;
    info!("VNC proxy shutdown complete");
    Ok(())
}
