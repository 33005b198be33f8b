// file: src/network/tftp/mod.rs
// version: 1.0.0
// guid: 5d6e7f8a-9b0c-4d1e-8f2a-4b5c6d7e8f9a

//! TFTP service for PXE clients

pub mod packet;
pub mod server;
pub mod undi;

pub use server::TftpServer;
