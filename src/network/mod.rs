// file: src/network/mod.rs
// version: 2.0.0
// guid: s9t0u1v2-w3x4-5678-9012-345678stuvwx

//! Network bring-up and the management services (HTTP, TFTP, DHCP)

pub mod addr;
pub mod dhcp;
pub mod http;
pub mod setup;
pub mod tftp;

pub use addr::Ipv4Cidr;
pub use setup::NetworkBringUp;

use tokio::sync::watch;

/// Resolve once the shutdown flag is set or its sender is gone. No
/// `watch::Ref` outlives this call.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
