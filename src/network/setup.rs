// file: src/network/setup.rs
// version: 1.0.0
// guid: 7b8c9d0e-1f2a-4b3c-8d4e-5f6a7b8c9d0e

//! Interface bring-up and addressing

use super::addr::Ipv4Cidr;
use crate::config::InstallConfig;
use crate::error::K8sInitError;
use crate::system::executor::CommandExecutor;
use crate::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

pub const LOOPBACK: &str = "lo";
const LOOPBACK_ADDRESS: &str = "127.0.0.1/8";

#[derive(Debug, Clone, Deserialize)]
pub struct LinkInfo {
    pub ifname: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub operstate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddrShow {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

pub struct NetworkBringUp<'a> {
    exec: &'a dyn CommandExecutor,
}

impl<'a> NetworkBringUp<'a> {
    pub fn new(exec: &'a dyn CommandExecutor) -> Self {
        Self { exec }
    }

    pub async fn list_links(&self) -> Result<Vec<LinkInfo>> {
        let out = self
            .exec
            .execute_with_output("ip", &["-j", "link", "show"])
            .await?;
        Ok(serde_json::from_str(&out)?)
    }

    /// Interface name to MAC address, loopback excluded
    pub async fn interfaces_with_macs(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .list_links()
            .await?
            .into_iter()
            .filter(|l| l.ifname != LOOPBACK)
            .map(|l| (l.ifname, l.address.unwrap_or_default()))
            .collect())
    }

    pub async fn link_up(&self, ifname: &str) -> Result<()> {
        self.exec
            .execute("ip", &["link", "set", ifname, "up"])
            .await
            .map_err(|e| K8sInitError::network(format!("cannot set ip link up {}: {}", ifname, e)))
    }

    pub async fn add_address(&self, ifname: &str, cidr: &Ipv4Cidr) -> Result<()> {
        let cidr = cidr.to_string();
        self.exec
            .execute("ip", &["addr", "add", &cidr, "dev", ifname])
            .await
            .map_err(|e| {
                K8sInitError::network(format!("cannot add ipmask {} to if {}: {}", cidr, ifname, e))
            })
    }

    pub async fn add_default_gateway(&self, gateway: Ipv4Addr) -> Result<()> {
        let gw = gateway.to_string();
        self.exec
            .execute("ip", &["route", "add", "default", "via", &gw])
            .await
            .map_err(|e| K8sInitError::network(format!("cannot add gw {}: {}", gw, e)))
    }

    /// Assign 127.0.0.1/8; an existing address is fine
    pub async fn setup_loopback(&self) -> Result<()> {
        let out = self
            .exec
            .run("ip", &["addr", "add", LOOPBACK_ADDRESS, "dev", LOOPBACK])
            .await?;
        if out.success() || out.stderr.contains("File exists") {
            return Ok(());
        }
        Err(K8sInitError::network(format!(
            "cannot set loopback ip address: {}",
            out.stderr.trim()
        )))
    }

    /// Start a background DHCP client; failures are only logged
    pub async fn start_dhcp_client(&self, ifname: &str) {
        let pidfile = format!("/run/udhcpc.{}.pid", ifname);
        match self
            .exec
            .run("udhcpc", &["-i", ifname, "-b", "-p", &pidfile])
            .await
        {
            Ok(out) if out.success() => debug!("dhcp client started on {}", ifname),
            Ok(out) => warn!("cannot start dhcp client on {}: {}", ifname, out.combined().trim()),
            Err(e) => warn!("cannot start dhcp client on {}: {}", ifname, e),
        }
    }

    /// First IPv4 address of `ifname`
    pub async fn interface_ipv4(&self, ifname: &str) -> Result<Option<Ipv4Cidr>> {
        let out = self
            .exec
            .execute_with_output("ip", &["-j", "-4", "addr", "show", "dev", ifname])
            .await?;
        let shows: Vec<IpAddrShow> = serde_json::from_str(&out)?;
        for info in shows.iter().flat_map(|s| s.addr_info.iter()) {
            if info.family != "inet" {
                continue;
            }
            if let Ok(addr) = info.local.parse::<Ipv4Addr>() {
                return Ok(Some(Ipv4Cidr::new(addr, info.prefixlen)?));
            }
        }
        Ok(None)
    }

    /// Static address, falling back to a DHCP client when it cannot be
    /// applied. Once the address is on the link a gateway failure is
    /// returned as is.
    async fn static_or_dhcp(&self, ifname: &str, cidr: &str, gateway: Option<&str>) -> Result<()> {
        let applied = async {
            let cidr: Ipv4Cidr = cidr.parse()?;
            self.add_address(ifname, &cidr).await
        }
        .await;

        if let Err(e) = applied {
            warn!("static addressing of {} failed, falling back to dhcp: {}", ifname, e);
            self.start_dhcp_client(ifname).await;
            return Ok(());
        }

        if let Some(gw) = gateway.filter(|gw| !gw.is_empty()) {
            let gw: Ipv4Addr = gw.parse().map_err(|e| {
                K8sInitError::validation(format!("Invalid gateway '{}': {}", gw, e))
            })?;
            self.add_default_gateway(gw).await?;
        }
        Ok(())
    }

    /// Bring every link up and address it. Without a configuration every
    /// interface gets a DHCP client.
    pub async fn bring_up(&self, config: Option<&InstallConfig>) -> Result<()> {
        for link in self.list_links().await? {
            self.link_up(&link.ifname).await?;
            if link.ifname == LOOPBACK {
                self.setup_loopback().await?;
            } else if config.is_none() {
                self.start_dhcp_client(&link.ifname).await;
            }
        }

        let Some(config) = config else {
            info!("network up in bootstrap mode");
            return Ok(());
        };

        if config.is_external_network_static {
            self.static_or_dhcp(
                &config.external_network,
                &config.external_network_ip_and_prefix,
                Some(&config.external_network_gateway),
            )
            .await?;
        } else {
            self.start_dhcp_client(&config.external_network).await;
        }

        if config.has_separate_admin_network() {
            if config.is_admin_network_static {
                self.static_or_dhcp(
                    &config.admin_network,
                    &config.admin_network_ip_and_prefix,
                    None,
                )
                .await?;
            } else {
                self.start_dhcp_client(&config.admin_network).await;
            }
        }

        let internal = config.internal_address()?;
        self.add_address(&config.internal_network, &internal).await?;
        info!("internal network {} on {}", internal, config.internal_network);
        Ok(())
    }
}
