//! vncgate VNC Proxy Library
//!
//! Bridges VNC clients arriving over TCP to a virtual machine's local VNC
//! Unix socket. The proxy forwards opaque bytes and knows nothing of RFB.

pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Config, ProxyConfig, DEFAULT_PORT};
pub use error::ProxyError;
pub use proxy::{ProxyStats, StatsSnapshot, VncProxy};
