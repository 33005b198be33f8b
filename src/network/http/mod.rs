// file: src/network/http/mod.rs
// version: 1.0.0
// guid: 7a8b9c0d-1e2f-4a3b-8c4d-5e6f7a8b9c0d

//! HTTP control server and API

pub mod api;
pub mod server;

pub use api::{router, ApiState};
pub use server::HttpServer;
