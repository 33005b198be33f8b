// file: src/network/addr.rs
// version: 1.0.0
// guid: 00762080-8725-440f-b5ef-ba22ee06064c

//! IPv4 address/prefix arithmetic

use crate::error::K8sInitError;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An interface address together with its prefix length, e.g. `10.0.0.1/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> crate::Result<Self> {
        if prefix > 32 {
            return Err(K8sInitError::validation(format!(
                "Invalid prefix length {} for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn mask_bits(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// Network base address
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask_bits())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !self.mask_bits())
    }

    pub fn host_bits(&self) -> u8 {
        32 - self.prefix
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask_bits() == u32::from(self.network())
    }
}

impl FromStr for Ipv4Cidr {
    type Err = K8sInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| K8sInitError::validation(format!("Missing prefix in '{}'", s)))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| K8sInitError::validation(format!("Invalid address '{}': {}", addr, e)))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|e| K8sInitError::validation(format!("Invalid prefix '{}': {}", prefix, e)))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}
