// file: src/network/dhcp/server.rs
// version: 1.0.0
// guid: 0e1f2a3b-4c5d-4e6f-9a7b-8c9d0e1f2a3b

//! Supervised DHCP listener
//!
//! The serve loop is relaunched after a listener failure for as long as the
//! started flag is set. `stop` clears the flag first, then wakes the
//! listener and joins the task.

use super::packet::DhcpPacket;
use super::responder::{reply_destination, DhcpResponder, PoolPlan};
use crate::config::InitSettings;
use crate::error::K8sInitError;
use crate::network::setup::NetworkBringUp;
use crate::network::stop_requested;
use crate::system::executor::CommandExecutor;
use crate::Result;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RESTART_DELAY: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 1500;

pub struct DhcpServer {
    responder: Arc<DhcpResponder>,
    bind: SocketAddrV4,
    client_port: u16,
    ifname: String,
    started: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DhcpServer {
    /// Build the server for the internal interface. Without a pool name the
    /// node is not installed and the server is unavailable.
    pub async fn new(
        pool_name: &str,
        ifname: &str,
        settings: &InitSettings,
        exec: &dyn CommandExecutor,
    ) -> Result<Self> {
        if pool_name.is_empty() {
            return Err(K8sInitError::NotProvisioned);
        }

        let server = NetworkBringUp::new(exec)
            .interface_ipv4(ifname)
            .await?
            .ok_or_else(|| {
                K8sInitError::network(format!("cannot find server ip address on {}", ifname))
            })?;
        let plan = PoolPlan::from_interface(server)?;
        info!(
            "dhcp pool on {}: start {} max {} hosts",
            ifname, plan.start, plan.max_hosts
        );

        let responder = DhcpResponder::new(
            plan,
            settings.lease_time(),
            &settings.undi_filename,
            settings.http_port,
        );
        Ok(Self::with_responder(
            responder,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, settings.dhcp_server_port),
            settings.dhcp_client_port,
            ifname,
        ))
    }

    pub fn with_responder(
        responder: DhcpResponder,
        bind: SocketAddrV4,
        client_port: u16,
        ifname: &str,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            responder: Arc::new(responder),
            bind,
            client_port,
            ifname: ifname.to_string(),
            started: Arc::new(AtomicBool::new(false)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn responder(&self) -> &DhcpResponder {
        &self.responder
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Launch the supervised serve loop and return immediately
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("dhcpd already started");
            return;
        }
        self.shutdown.send_replace(false);

        let ctx = ServeContext {
            responder: Arc::clone(&self.responder),
            bind: self.bind,
            client_port: self.client_port,
            ifname: self.ifname.clone(),
        };
        let started = Arc::clone(&self.started);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(supervise(ctx, started, shutdown));

        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *task = Some(handle);
    }

    /// Stop the serve loop and wait until the socket is released. Safe to
    /// call repeatedly and before `start`.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("dhcpd task failed: {}", e);
            }
            info!("dhcpd stopped");
        }
    }
}

struct ServeContext {
    responder: Arc<DhcpResponder>,
    bind: SocketAddrV4,
    client_port: u16,
    ifname: String,
}

async fn supervise(
    ctx: ServeContext,
    started: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    while started.load(Ordering::SeqCst) {
        info!("dhcpd will be started on {}", ctx.bind);
        match serve(&ctx, &mut shutdown).await {
            Ok(()) => debug!("dhcpd listener closed"),
            Err(e) => error!("dhcpd stopped, it will be restarted: {}", e),
        }

        // Owner dropped without stopping
        if shutdown.has_changed().is_err() {
            break;
        }
        if started.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(RESTART_DELAY) => {}
                _ = stop_requested(&mut shutdown) => {}
            }
        }
    }
}

async fn serve(ctx: &ServeContext, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    let socket = bind_socket(ctx.bind, &ctx.ifname)?;
    let server_port = ctx.bind.port();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = stop_requested(shutdown) => return Ok(()),
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received?;
                let Some((reply, dest)) =
                    handle_datagram(&ctx.responder, &buf[..len], server_port, ctx.client_port)
                else {
                    continue;
                };
                debug!("dhcp reply for {} to {}", peer, dest);
                if let Err(e) = socket.send_to(&reply, SocketAddr::V4(dest)).await {
                    error!("cannot send dhcp reply: {}", e);
                }
            }
        }
    }
}

/// Decode one datagram and build the encoded reply with its destination
pub fn handle_datagram(
    responder: &DhcpResponder,
    data: &[u8],
    server_port: u16,
    client_port: u16,
) -> Option<(Bytes, SocketAddrV4)> {
    let request = match DhcpPacket::decode(data) {
        Ok(request) => request,
        Err(e) => {
            debug!("ignoring dhcp datagram: {}", e);
            return None;
        }
    };
    let reply = responder.respond(&request)?;
    Some((
        reply.encode(),
        reply_destination(&request, server_port, client_port),
    ))
}

fn bind_socket(bind: SocketAddrV4, ifname: &str) -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(bind)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    if !ifname.is_empty() {
        if let Err(e) = bind_to_device(&socket, ifname) {
            warn!("cannot bind dhcp socket to {}: {}", ifname, e);
        }
    }
    Ok(UdpSocket::from_std(socket)?)
}

/// Restrict a socket to one interface (SO_BINDTODEVICE)
pub(crate) fn bind_to_device(socket: &std::net::UdpSocket, ifname: &str) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let name = ifname.as_bytes();
    // SAFETY: the pointer and length describe `name`, which outlives the call
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            name.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dhcp::packet::{MessageType, OPT_USER_CLASS};
    use crate::system::executor::scripted::ScriptedExecutor;

    fn responder() -> DhcpResponder {
        let plan = PoolPlan::from_interface("127.0.0.1/8".parse().unwrap()).unwrap();
        DhcpResponder::new(plan, Duration::from_secs(1800), "undionly.kpxe", 8000)
    }

    fn loopback_server() -> DhcpServer {
        DhcpServer::with_responder(
            responder(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            68,
            "",
        )
    }

    #[tokio::test]
    async fn test_new_without_pool_is_not_provisioned() {
        let exec = ScriptedExecutor::new();
        let err = DhcpServer::new("", "eth1", &InitSettings::default(), &exec)
            .await
            .err()
            .unwrap();
        assert!(err.is_not_provisioned());
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_new_reads_interface_address() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "ip -j -4 addr show dev eth1",
            r#"[{"addr_info":[{"family":"inet","local":"10.10.0.1","prefixlen":24}]}]"#,
        );
        let server = DhcpServer::new("zp_k8s", "eth1", &InitSettings::default(), &exec)
            .await
            .unwrap();
        assert_eq!(server.responder().plan().start, Ipv4Addr::new(10, 10, 0, 10));
    }

    #[tokio::test]
    async fn test_new_without_address_fails() {
        let exec = ScriptedExecutor::new();
        exec.on("ip -j -4 addr show", "[]");
        let result = DhcpServer::new("zp_k8s", "eth1", &InitSettings::default(), &exec).await;
        assert!(matches!(result, Err(K8sInitError::Network(_))));
    }

    #[test]
    fn test_handle_datagram() {
        let r = responder();
        let mut request = DhcpPacket::default();
        request.set_message_type(MessageType::Discover);
        request.set_option(OPT_USER_CLASS, b"iPXE".to_vec());

        let (reply, dest) = handle_datagram(&r, &request.encode(), 67, 68).unwrap();
        let reply = DhcpPacket::decode(&reply).unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Offer));
        assert_eq!(dest, SocketAddrV4::new(Ipv4Addr::BROADCAST, 68));

        assert!(handle_datagram(&r, b"garbage", 67, 68).is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_and_twice() {
        let server = loopback_server();
        server.stop().await;
        server.start();
        assert!(server.is_started());
        server.stop().await;
        server.stop().await;
        assert!(!server.is_started());
    }

    fn unicast_discover() -> Bytes {
        let mut request = DhcpPacket {
            xid: 0x1234_5678,
            ..Default::default()
        };
        // ciaddr makes the reply unicast back to the test socket
        request.ciaddr = Ipv4Addr::LOCALHOST;
        request.set_message_type(MessageType::Discover);
        request.encode()
    }

    #[tokio::test]
    async fn test_listener_restarts_after_bind_failure() {
        let blocker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let bind = match blocker.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_port = client.local_addr().unwrap().port();

        let server = DhcpServer::with_responder(responder(), bind, client_port, "");
        server.start();

        // First attempts fail while the port is taken
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(server.is_started());
        drop(blocker);

        let discover = unicast_discover();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let reply = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                client.send_to(&discover, bind).await.unwrap();
                match tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buf))
                    .await
                {
                    Ok(Ok((len, _))) => break DhcpPacket::decode(&buf[..len]).unwrap(),
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(reply.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.xid, 0x1234_5678);

        tokio::time::timeout(Duration::from_secs(3), server.stop())
            .await
            .unwrap();
        assert!(!server.is_started());
    }

    #[tokio::test]
    async fn test_stop_wins_over_pending_restart() {
        let blocker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let bind = match blocker.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        let server = DhcpServer::with_responder(responder(), bind, 68, "");
        server.start();
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(3), server.stop())
            .await
            .unwrap();
        assert!(!server.is_started());
        drop(blocker);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = loopback_server();
        server.start();
        server.stop().await;
        server.start();
        assert!(server.is_started());
        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .unwrap();
    }
}
