// file: src/network/dhcp/responder.rs
// version: 1.0.0
// guid: 9d0e1f2a-3b4c-4d5e-8f6a-7b8c9d0e1f2a

//! DHCP request/reply state machine for PXE and iPXE boot
//!
//! Every client is offered the same pool-start address; there is no lease
//! table. The responder exists to bootstrap one install or boot flow at a
//! time and is not a general purpose DHCP server.

use super::packet::*;
use crate::error::K8sInitError;
use crate::network::Ipv4Cidr;
use crate::Result;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tracing::{debug, warn};

/// Low host addresses left out of the pool
pub const POOL_OFFSET: u32 = 10;

/// Address pool carved from the internal interface address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    pub server: Ipv4Cidr,
    pub start: Ipv4Addr,
    pub max_hosts: u32,
}

impl PoolPlan {
    pub fn from_interface(server: Ipv4Cidr) -> Result<Self> {
        if server.prefix() > 30 {
            return Err(K8sInitError::network(format!(
                "subnet {} too small for a dhcp pool",
                server
            )));
        }

        let base = u32::from(server.network());
        let first = base + 1;
        let last = u32::from(server.broadcast()) - 1;
        let own = u32::from(server.addr());

        let mut start = base.saturating_add(POOL_OFFSET).clamp(first, last);
        if start == own {
            start = if start < last { start + 1 } else { start - 1 };
        }

        let mut max_hosts = last - start + 1;
        if (start..=last).contains(&own) {
            max_hosts -= 1;
        }

        Ok(Self {
            server,
            start: Ipv4Addr::from(start),
            max_hosts,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DhcpResponder {
    plan: PoolPlan,
    lease_time: Duration,
    undi_filename: String,
    http_port: u16,
}

impl DhcpResponder {
    pub fn new(plan: PoolPlan, lease_time: Duration, undi_filename: &str, http_port: u16) -> Self {
        Self {
            plan,
            lease_time,
            undi_filename: undi_filename.to_string(),
            http_port,
        }
    }

    pub fn plan(&self) -> &PoolPlan {
        &self.plan
    }

    fn server_ip(&self) -> Ipv4Addr {
        self.plan.server.addr()
    }

    /// Boot file for a client: the chainload script for iPXE, the network
    /// boot binary for anything else
    pub fn boot_file_name(&self, user_class: &[String]) -> String {
        if user_class.len() == 1 && user_class[0] == "iPXE" {
            format!("http://{}:{}/api/network/tftp", self.server_ip(), self.http_port)
        } else {
            self.undi_filename.clone()
        }
    }

    /// Build the reply for `request`, or `None` when it must be ignored
    pub fn respond(&self, request: &DhcpPacket) -> Option<DhcpPacket> {
        if request.op != OP_BOOT_REQUEST {
            return None;
        }

        let reply_type = match request.message_type() {
            Some(MessageType::Discover) => MessageType::Offer,
            Some(MessageType::Request) => MessageType::Ack,
            other => {
                warn!(
                    "unsupported dhcp message {:?} from {}",
                    other,
                    request.client_hw_addr()
                );
                return None;
            }
        };

        let server = self.server_ip();
        let user_class = request.user_class();
        let boot_file = self.boot_file_name(&user_class);

        let mut reply = DhcpPacket {
            op: OP_BOOT_REPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: request.ciaddr,
            yiaddr: self.plan.start,
            siaddr: server,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            ..Default::default()
        };
        reply.set_message_type(reply_type);
        reply.set_addr_option(OPT_SERVER_ID, server);
        reply.set_addr_option(OPT_SUBNET_MASK, self.plan.server.mask());
        reply.set_addr_option(OPT_DNS, server);
        reply.set_addr_option(OPT_ROUTER, server);
        reply.set_addr_option(OPT_NTP_SERVERS, server);
        let lease = u32::try_from(self.lease_time.as_secs()).unwrap_or(u32::MAX);
        reply.set_option(OPT_LEASE_TIME, lease.to_be_bytes().to_vec());
        reply.set_option(OPT_BOOTFILE_NAME, boot_file.as_bytes().to_vec());
        reply.set_option(OPT_TFTP_SERVER_NAME, server.to_string().into_bytes());
        reply.set_file(&boot_file);

        debug!(
            "{:?} to {} (user-class {:?}): {} boot {}",
            reply_type,
            request.client_hw_addr(),
            user_class,
            self.plan.start,
            boot_file
        );
        Some(reply)
    }
}

/// Where a reply goes: the relay if any, else the client's own address,
/// else broadcast
pub fn reply_destination(
    request: &DhcpPacket,
    server_port: u16,
    client_port: u16,
) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, server_port)
    } else if !request.ciaddr.is_unspecified() {
        SocketAddrV4::new(request.ciaddr, client_port)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, client_port)
    }
}
