// file: src/network/dhcp/mod.rs
// version: 1.0.0
// guid: 1f2a3b4c-5d6e-4f7a-8b9c-0d1e2f3a4b5c

//! DHCP responder for PXE provisioning

pub mod packet;
pub mod responder;
pub mod server;

pub use packet::{DhcpPacket, MessageType};
pub use responder::{DhcpResponder, PoolPlan};
pub use server::DhcpServer;
