//! TCP to Unix socket stream proxy.
//!
//! ## Architecture
//!
//! ```text
//! VNC client -> TcpListener (per bind address) -> session -> UnixStream (VM socket)
//! ```
//!
//! - Every configured address gets its own listener; start succeeds if at
//!   least one binds
//! - Each accepted connection dials the socket independently; a dial failure
//!   closes that client only
//! - `stop()` closes all listeners and returns once every session is gone
//!
//! ## Usage
//!
//! ```ignore
//! let proxy = VncProxy::new(ProxyConfig::new("/var/run/vm/vnc.sock"));
//! proxy.start().await?;
//! // ...
//! proxy.stop().await;
//! ```

mod listener;
mod session;
mod stats;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::config::ProxyConfig;
use crate::error::ProxyError;

pub use stats::{ProxyStats, StatsSnapshot};

enum State {
    Idle,
    Running {
        listeners: Vec<JoinHandle<()>>,
        local_addrs: Vec<SocketAddr>,
    },
    Stopped,
}

/// Forwards TCP clients on the configured addresses to one local socket.
pub struct VncProxy {
    config: ProxyConfig,
    stats: Arc<ProxyStats>,
    shutdown_tx: watch::Sender<bool>,
    state: Mutex<State>,
}

impl VncProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            stats: Arc::new(ProxyStats::default()),
            shutdown_tx,
            state: Mutex::new(State::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind every configured address and start accepting.
    ///
    /// Addresses that fail to bind are logged and skipped. Fails only if
    /// none bind, or if the proxy was already started.
    pub async fn start(&self) -> Result<Vec<SocketAddr>, ProxyError> {
        if !matches!(*self.lock(), State::Idle) {
            return Err(ProxyError::AlreadyStarted);
        }
        if self.config.bind_addrs.is_empty() {
            return Err(ProxyError::NoBindAddrs);
        }

        let mut bound = Vec::new();
        let mut failures = Vec::new();
        for ip in &self.config.bind_addrs {
            let addr = SocketAddr::new(*ip, self.config.port);
            match TcpListener::bind(addr).await.and_then(|l| {
                let local = l.local_addr()?;
                Ok((l, local))
            }) {
                Ok(listener) => bound.push(listener),
                Err(e) => {
                    warn!(bind_addr = %addr, error = %e, "Failed to bind VNC listener");
                    failures.push((*ip, e));
                }
            }
        }

        if bound.is_empty() {
            return Err(ProxyError::Bind {
                port: self.config.port,
                failures,
            });
        }

        let mut state = self.lock();
        // A concurrent start may have won while we were binding.
        if !matches!(*state, State::Idle) {
            return Err(ProxyError::AlreadyStarted);
        }

        let socket_path = Arc::new(self.config.socket_path.clone());
        let mut listeners = Vec::with_capacity(bound.len());
        let mut local_addrs = Vec::with_capacity(bound.len());
        for (tcp, local_addr) in bound {
            local_addrs.push(local_addr);
            listeners.push(tokio::spawn(
                listener::run(
                    tcp,
                    local_addr,
                    Arc::clone(&socket_path),
                    Arc::clone(&self.stats),
                    self.shutdown_tx.subscribe(),
                )
                .instrument(tracing::info_span!("listener", addr = %local_addr)),
            ));
        }

        info!(
            addrs = ?local_addrs,
            socket = %self.config.socket_path.display(),
            "VNC proxy started"
        );
        *state = State::Running {
            listeners,
            local_addrs: local_addrs.clone(),
        };
        Ok(local_addrs)
    }

    /// Addresses currently accepting connections.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        match &*self.lock() {
            State::Running { local_addrs, .. } => local_addrs.clone(),
            State::Idle | State::Stopped => Vec::new(),
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Close every listener and session, returning once all have ended.
    ///
    /// Safe to call more than once, and before [`VncProxy::start`].
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock(), State::Stopped);
        let State::Running { listeners, .. } = previous else {
            return;
        };

        info!("Stopping VNC proxy");
        self.shutdown_tx.send_replace(true);

        for handle in listeners {
            if let Err(e) = handle.await {
                error!(error = %e, "Listener task failed");
            }
        }
        info!(stats = ?self.stats.snapshot(), "VNC proxy stopped");
    }
}

impl Drop for VncProxy {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
