//! TCP accept loop.
//!
//! Each bound address gets its own loop. Accepted connections become
//! sessions tracked in a [`JoinSet`], so the loop can wait for all of them
//! to finish once shutdown is signalled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use super::session;
use super::stats::ProxyStats;

/// Pause after a failed accept to avoid spinning on persistent errors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until shutdown, then wait for every session to end.
pub(crate) async fn run(
    listener: TcpListener,
    local_addr: SocketAddr,
    socket_path: Arc<PathBuf>,
    stats: Arc<ProxyStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(bind_addr = %local_addr, socket = %socket_path.display(), "Listener started");

    let session_shutdown = shutdown.clone();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = async { shutdown.wait_for(|down| *down).await.map(|_| ()) } => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    if *session_shutdown.borrow() {
                        break;
                    }
                    stats.session_opened();

                    let socket_path = Arc::clone(&socket_path);
                    let stats = Arc::clone(&stats);
                    let shutdown = session_shutdown.clone();
                    sessions.spawn(
                        async move {
                            session::forward(stream, peer_addr, &socket_path, &stats, shutdown).await;
                        }
                        .instrument(tracing::info_span!("session", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(bind_addr = %local_addr, error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },

            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "Session task failed");
                }
            }
        }
    }

    drop(listener);
    debug!(bind_addr = %local_addr, sessions = sessions.len(), "Listener closed, draining sessions");

    while let Some(finished) = sessions.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Session task failed");
        }
    }
    info!(bind_addr = %local_addr, "Listener stopped");
}
