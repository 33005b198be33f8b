// file: src/management/mod.rs
// version: 1.0.0
// guid: 1a2b3c4d-5e6f-4a7b-8c9d-0e1f2a3b4c5d

//! Management services lifecycle
//!
//! One handle per process owns the HTTP, TFTP and DHCP servers. HTTP is
//! always present; TFTP and DHCP only exist on an installed manager.

use crate::config::{InitSettings, Role};
use crate::network::dhcp::DhcpServer;
use crate::network::http::{router, ApiState, HttpServer};
use crate::network::tftp::TftpServer;
use crate::system::executor::CommandExecutor;
use crate::Result;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Anything the power state machine must stop before terminating
#[async_trait]
pub trait StopAll: Send + Sync {
    async fn stop_all(&self);
}

/// Inputs for building the service set
pub struct ServiceParams {
    pub role: Role,
    /// Empty when the node is not installed
    pub pool_name: String,
    pub internal_ifname: String,
    pub tftp_root: PathBuf,
    pub htdocs_dir: PathBuf,
    pub api: ApiState,
}

pub struct ManagementServices {
    http: HttpServer,
    tftp: Option<TftpServer>,
    dhcp: Option<DhcpServer>,
}

impl ManagementServices {
    pub fn new(http: HttpServer, tftp: Option<TftpServer>, dhcp: Option<DhcpServer>) -> Self {
        Self { http, tftp, dhcp }
    }

    /// Build the servers for `params`. A "not provisioned" TFTP or DHCP
    /// server is left out; any other construction error is returned.
    pub async fn build(
        params: ServiceParams,
        settings: &InitSettings,
        exec: &dyn CommandExecutor,
    ) -> Result<Self> {
        let addr = SocketAddr::from((settings.http_address, settings.http_port));
        let http = HttpServer::new(addr, router(params.api, params.htdocs_dir));

        let mut tftp = None;
        let mut dhcp = None;
        if params.role == Role::Manager {
            tftp = optional(
                "tftpd",
                TftpServer::new(&params.pool_name, params.tftp_root, settings),
            )?;
            dhcp = optional(
                "dhcpd",
                DhcpServer::new(&params.pool_name, &params.internal_ifname, settings, exec).await,
            )?;
        }

        Ok(Self::new(http, tftp, dhcp))
    }

    pub fn http(&self) -> &HttpServer {
        &self.http
    }

    pub fn tftp(&self) -> Option<&TftpServer> {
        self.tftp.as_ref()
    }

    pub fn dhcp(&self) -> Option<&DhcpServer> {
        self.dhcp.as_ref()
    }

    pub async fn start_http(&self) -> Result<()> {
        self.http.start().await
    }

    /// Start TFTP on `server_ip` if this node has one
    pub async fn start_tftp(&self, server_ip: Ipv4Addr) -> Result<()> {
        match &self.tftp {
            Some(tftp) => tftp.start(server_ip).await,
            None => {
                warn!("tftpd is not available on this node");
                Ok(())
            }
        }
    }

    pub fn start_dhcp(&self) {
        match &self.dhcp {
            Some(dhcp) => dhcp.start(),
            None => warn!("dhcpd is not available on this node"),
        }
    }
}

fn optional<T>(name: &str, built: Result<T>) -> Result<Option<T>> {
    match built {
        Ok(server) => Ok(Some(server)),
        Err(e) if e.is_not_provisioned() => {
            info!("{} unavailable: {}", name, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl StopAll for ManagementServices {
    /// Stop TFTP, then DHCP, then HTTP. Each stop waits for its listener.
    async fn stop_all(&self) {
        if let Some(tftp) = &self.tftp {
            tftp.stop().await;
        }
        if let Some(dhcp) = &self.dhcp {
            dhcp.stop().await;
        }
        self.http.stop().await;
        info!("management services stopped");
    }
}

/// Owns the single `ManagementServices` handle of the process
#[derive(Default)]
pub struct ServiceRegistry {
    handle: OnceCell<Arc<ManagementServices>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the handle on first use; later calls return the same one and
    /// ignore their parameters.
    pub async fn acquire(
        &self,
        params: ServiceParams,
        settings: &InitSettings,
        exec: &dyn CommandExecutor,
    ) -> Result<Arc<ManagementServices>> {
        let handle = self
            .handle
            .get_or_try_init(|| async {
                ManagementServices::build(params, settings, exec)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    pub fn get(&self) -> Option<Arc<ManagementServices>> {
        self.handle.get().cloned()
    }
}
