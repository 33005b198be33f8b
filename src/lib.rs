// file: src/lib.rs
// version: 3.0.0
// guid: d82472d1-7f0f-4eb4-b0a3-6e1547103eb4

//! # k8sinit
//!
//! PID 1 for a storage backed cluster appliance. It brings the node up,
//! provisions its disk on request and, on a manager node, network boots
//! the other nodes over DHCP, TFTP and HTTP.

pub mod app;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod installer;
pub mod logging;
pub mod management;
pub mod network;
pub mod system;

pub use error::{K8sInitError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
