// file: src/config/mod.rs
// version: 1.0.0
// guid: 790519c6-470d-4fe9-9684-1c25693ca019

//! Configuration module for k8sinit
//!
//! Holds the persisted install configuration, the node role, kernel
//! parameters and the appliance settings.

pub mod cmdline;
pub mod settings;
pub mod store;

pub use cmdline::KernelParams;
pub use settings::InitSettings;
pub use store::ConfigStore;

use crate::error::K8sInitError;
use crate::network::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of this node, read from `k8sinit.role` at every boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Provisions other nodes (TFTP + DHCP in addition to HTTP)
    Manager,
    #[default]
    Node,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Node => "node",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = K8sInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "manager" => Ok(Role::Manager),
            "node" => Ok(Role::Node),
            other => Err(K8sInitError::validation(format!("Unknown role: {}", other))),
        }
    }
}

/// Install configuration persisted on the provisioned pool.
///
/// The JSON keys match what the web console submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Target disk device path (e.g., /dev/sda)
    #[serde(rename = "Disk")]
    pub disk: String,
    /// Destroy an existing pool with the same name
    #[serde(rename = "Force", default)]
    pub force: bool,
    #[serde(rename = "PoolName")]
    pub pool_name: String,
    #[serde(rename = "ExternalNetwork")]
    pub external_network: String,
    #[serde(rename = "IsExternalNetworkStatic", default)]
    pub is_external_network_static: bool,
    #[serde(rename = "ExternalNetworkIPAndPrefix", default)]
    pub external_network_ip_and_prefix: String,
    #[serde(rename = "ExternalNetworkGateway", default)]
    pub external_network_gateway: String,
    #[serde(rename = "AdminNetwork")]
    pub admin_network: String,
    #[serde(rename = "IsAdminNetworkStatic", default)]
    pub is_admin_network_static: bool,
    #[serde(rename = "AdminNetworkIPAndPrefix", default)]
    pub admin_network_ip_and_prefix: String,
    /// Cluster network; always statically addressed
    #[serde(rename = "InternalNetwork")]
    pub internal_network: String,
    #[serde(rename = "InternalNetworkIPAndPrefix")]
    pub internal_network_ip_and_prefix: String,
}

impl InstallConfig {
    /// Validate the install configuration before any disk is touched
    pub fn validate(&self) -> crate::Result<()> {
        if !self.disk.starts_with("/dev/") {
            return Err(K8sInitError::validation(format!(
                "Invalid disk device: {}",
                self.disk
            )));
        }

        if self.pool_name.is_empty() || self.pool_name.contains('/') {
            return Err(K8sInitError::validation(format!(
                "Invalid pool name: '{}'",
                self.pool_name
            )));
        }

        for (label, ifname) in [
            ("external", &self.external_network),
            ("admin", &self.admin_network),
            ("internal", &self.internal_network),
        ] {
            if ifname.is_empty() {
                return Err(K8sInitError::validation(format!(
                    "{} network interface cannot be empty",
                    label
                )));
            }
        }

        if self.is_external_network_static {
            self.external_network_ip_and_prefix.parse::<Ipv4Cidr>()?;
            self.external_network_gateway
                .parse::<std::net::Ipv4Addr>()
                .map_err(|e| {
                    K8sInitError::validation(format!(
                        "Invalid external gateway '{}': {}",
                        self.external_network_gateway, e
                    ))
                })?;
        }

        if self.is_admin_network_static && self.admin_network != self.external_network {
            self.admin_network_ip_and_prefix.parse::<Ipv4Cidr>()?;
        }

        self.internal_address()?;

        Ok(())
    }

    /// Address and prefix of the internal (cluster) network
    pub fn internal_address(&self) -> crate::Result<Ipv4Cidr> {
        self.internal_network_ip_and_prefix.parse()
    }

    /// Whether the admin network needs its own addressing
    pub fn has_separate_admin_network(&self) -> bool {
        self.admin_network != self.external_network
    }
}
