//! Configuration for the VNC service controller.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::controller::DEFAULT_WORKERS;

/// Service account mount read when no explicit paths are given.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Controller process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server base URL.
    pub api_server_url: String,

    /// Bearer token file. Skipped if it does not exist.
    pub token_file: PathBuf,

    /// CA bundle for the API server certificate. Skipped if it does not exist.
    pub ca_file: PathBuf,

    /// Number of reconcile workers.
    pub workers: usize,

    /// Listen address of the health server.
    pub health_listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let api_server_url = match std::env::var("VNC_API_SERVER_URL") {
            Ok(url) => url,
            Err(_) => in_cluster_url(
                std::env::var("KUBERNETES_SERVICE_HOST").ok(),
                std::env::var("KUBERNETES_SERVICE_PORT").ok(),
            ),
        };

        let token_file = std::env::var("VNC_API_TOKEN_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Path::new(SERVICE_ACCOUNT_DIR).join("token"));

        let ca_file = std::env::var("VNC_API_CA_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt"));

        let workers = match std::env::var("VNC_CONTROLLER_WORKERS") {
            Ok(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .with_context(|| format!("VNC_CONTROLLER_WORKERS must be a positive integer, got {raw:?}"))?,
            Err(_) => DEFAULT_WORKERS,
        };

        let health_listen_addr = std::env::var("VNC_HEALTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string())
            .parse()
            .context("Invalid VNC_HEALTH_LISTEN_ADDR")?;

        let log_level = std::env::var("VNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            api_server_url,
            token_file,
            ca_file,
            workers,
            health_listen_addr,
            log_level,
        })
    }

    /// Bearer token, if the token file exists.
    pub fn read_token(&self) -> Result<Option<String>> {
        read_optional(&self.token_file)
            .map(|bytes| bytes.map(|b| String::from_utf8_lossy(&b).trim().to_string()))
    }

    /// CA bundle, if the CA file exists.
    pub fn read_ca(&self) -> Result<Option<Vec<u8>>> {
        read_optional(&self.ca_file)
    }
}

fn in_cluster_url(host: Option<String>, port: Option<String>) -> String {
    match (host, port) {
        (Some(host), port) if !host.is_empty() => {
            let port = port.unwrap_or_else(|| "443".to_string());
            if host.contains(':') {
                format!("https://[{host}]:{port}")
            } else {
                format!("https://{host}:{port}")
            }
        }
        _ => "https://kubernetes.default.svc".to_string(),
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
