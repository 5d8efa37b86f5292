//! Proxy configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;

/// What the proxy listens on and where it forwards to.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local VNC socket every session dials.
    pub socket_path: PathBuf,

    /// TCP port shared by all listeners. 0 picks an ephemeral port per address.
    pub port: u16,

    /// Addresses to listen on, one listener each.
    pub bind_addrs: Vec<IpAddr>,
}

impl ProxyConfig {
    /// Listen on `0.0.0.0:5900` and forward to `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            port: DEFAULT_PORT,
            bind_addrs: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_addrs(mut self, bind_addrs: Vec<IpAddr>) -> Self {
        self.bind_addrs = bind_addrs;
        self
    }
}

/// Proxy process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy: ProxyConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let socket_path = std::env::var("VNC_PROXY_SOCKET")
            .context("Missing VNC socket path. Set VNC_PROXY_SOCKET.")?;

        let port: u16 = std::env::var("VNC_PROXY_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("VNC_PROXY_PORT must be a port number.")?
            .unwrap_or(DEFAULT_PORT);

        let mut proxy = ProxyConfig::new(socket_path).with_port(port);
        if let Ok(raw) = std::env::var("VNC_PROXY_BIND_ADDRS") {
            proxy = proxy.with_bind_addrs(parse_bind_addrs(&raw)?);
        }

        let log_level = std::env::var("VNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self { proxy, log_level })
    }
}

/// Parse a comma-separated list of IP addresses.
pub fn parse_bind_addrs(raw: &str) -> Result<Vec<IpAddr>> {
    let addrs = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .with_context(|| format!("Invalid bind address {s:?} in VNC_PROXY_BIND_ADDRS"))
        })
        .collect::<Result<Vec<_>>>()?;

    if addrs.is_empty() {
        anyhow::bail!("VNC_PROXY_BIND_ADDRS is set but lists no addresses");
    }
    Ok(addrs)
}
