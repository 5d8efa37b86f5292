//! Proxy error types.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Errors returned by the proxy lifecycle calls.
///
/// Per-session failures never surface here; they are logged and counted.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy already started")]
    AlreadyStarted,

    #[error("no bind addresses configured")]
    NoBindAddrs,

    #[error("failed to bind port {port} on any address: {}", describe(.failures))]
    Bind {
        port: u16,
        failures: Vec<(IpAddr, io::Error)>,
    },
}

fn describe(failures: &[(IpAddr, io::Error)]) -> String {
    failures
        .iter()
        .map(|(addr, e)| format!("{addr}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}
