//! vncgate VNC Service Controller Library
//!
//! Gives each VirtualMachineInstance that declares `directVNCAccess` a
//! NodePort Service named `<vmi>-vnc`, and removes it again when the
//! declaration or the instance goes away.
//!
//! ## Architecture
//!
//! - **Informers**: list/watch VMIs and managed Services into caches
//! - **Controller**: turns VMI notifications into queue keys; workers
//!   reconcile one key at a time against current cache state
//! - **Service API**: the write path to the API server (in-memory fake for tests)
//! - **Health**: `/healthz`, `/livez`, `/readyz` for kubelet probes

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod fake;
pub mod health;
pub mod informer;
pub mod service;
pub mod vmi;

pub use client::{ApiClient, ApiError, ServiceApi};
pub use controller::{ControllerConfig, VncServiceController, DEFAULT_WORKERS};
pub use error::ControllerError;
pub use fake::{ApiCall, InMemoryServiceApi};
pub use informer::Informer;
pub use vmi::{DirectVncAccess, VirtualMachineInstance, DEFAULT_VNC_PORT};
