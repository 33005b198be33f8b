// file: src/network/tftp/server.rs
// version: 1.0.0
// guid: 4c5d6e7f-8a9b-4c0d-9e1f-3a4b5c6d7e8f

//! Read-only TFTP server for the network boot binary

use super::packet::*;
use super::undi::{download_undi, DOWNLOAD_TIMEOUT};
use crate::config::InitSettings;
use crate::error::K8sInitError;
use crate::network::stop_requested;
use crate::Result;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_RETRIES: usize = 5;

pub struct TftpServer {
    root: PathBuf,
    filename: String,
    undi_url: String,
    port: u16,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TftpServer {
    /// The server needs an installed node; without a pool name it reports
    /// `NotProvisioned`.
    pub fn new(pool_name: &str, root: PathBuf, settings: &InitSettings) -> Result<Self> {
        if pool_name.is_empty() {
            return Err(K8sInitError::NotProvisioned);
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            root,
            filename: settings.undi_filename.clone(),
            undi_url: settings.undi_url.clone(),
            port: settings.tftp_port,
            started: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    pub fn file_path(&self) -> PathBuf {
        self.root.join(&self.filename)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.local_addr.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Download the boot binary, then serve it on `server_ip`. A failed
    /// download is logged and the server still runs.
    pub async fn start(&self, server_ip: Ipv4Addr) -> Result<()> {
        let download = download_undi(&self.undi_url, &self.root, &self.filename, DOWNLOAD_TIMEOUT);
        if let Err(e) = download.await {
            error!("cannot download {}: {}", self.filename, e);
        }
        self.listen(server_ip).await
    }

    /// Bind `server_ip` and launch the serve loop without downloading
    pub async fn listen(&self, server_ip: Ipv4Addr) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("tftpd already started");
            return Ok(());
        }

        let socket = match UdpSocket::bind((server_ip, self.port)).await {
            Ok(socket) => socket,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(K8sInitError::network(format!(
                    "cannot start tftp server on {}:{}: {}",
                    server_ip, self.port, e
                )));
            }
        };
        let addr = socket.local_addr()?;
        if let Ok(mut guard) = self.local_addr.lock() {
            *guard = Some(addr);
        }
        info!("tftpd listening on {}", addr);

        self.shutdown.send_replace(false);
        let ctx = Arc::new(TransferContext {
            filename: self.filename.clone(),
            path: self.file_path(),
            local_ip: server_ip,
        });
        let handle = tokio::spawn(serve(socket, ctx, self.shutdown.subscribe()));
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *task = Some(handle);
        Ok(())
    }

    /// Stop serving and wait for the listener to close. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("tftpd task failed: {}", e);
            }
            info!("tftpd stopped");
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

struct TransferContext {
    filename: String,
    path: PathBuf,
    local_ip: Ipv4Addr,
}

async fn serve(socket: UdpSocket, ctx: Arc<TransferContext>, mut shutdown: watch::Receiver<bool>) {
    let mut transfers = JoinSet::new();
    let mut buf = vec![0u8; 4 + BLOCK_SIZE];

    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            Some(done) = transfers.join_next(), if !transfers.is_empty() => {
                if let Err(e) = done {
                    warn!("tftp transfer task failed: {}", e);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("tftp receive failed: {}", e);
                        continue;
                    }
                };
                match TftpPacket::decode(&buf[..len]) {
                    Ok(TftpPacket::ReadRequest { filename, mode }) => {
                        debug!("tftp read {} ({}) from {}", filename, mode, peer);
                        let ctx = Arc::clone(&ctx);
                        transfers.spawn(async move {
                            if let Err(e) = transfer(&ctx, &filename, peer).await {
                                warn!("tftp transfer to {} failed: {}", peer, e);
                            }
                        });
                    }
                    Ok(TftpPacket::WriteRequest { .. }) => {
                        let reply = TftpPacket::Error {
                            code: ERR_ILLEGAL_OPERATION,
                            message: "read only server".to_string(),
                        };
                        let _ = socket.send_to(&reply.encode(), peer).await;
                    }
                    Ok(other) => debug!("unexpected tftp packet from {}: {:?}", peer, other),
                    Err(e) => debug!("bad tftp packet from {}: {}", peer, e),
                }
            }
        }
    }

    transfers.shutdown().await;
}

async fn transfer(ctx: &TransferContext, filename: &str, peer: SocketAddr) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(ctx.local_ip), 0)).await?;
    socket.connect(peer).await?;

    if filename.trim_start_matches('/') != ctx.filename {
        let reply = TftpPacket::Error {
            code: ERR_FILE_NOT_FOUND,
            message: format!("only {} supported", ctx.filename),
        };
        socket.send(&reply.encode()).await?;
        return Ok(());
    }

    let data = match tokio::fs::read(&ctx.path).await {
        Ok(data) => Bytes::from(data),
        Err(e) => {
            let reply = TftpPacket::Error {
                code: ERR_NOT_DEFINED,
                message: format!("cannot open {}", ctx.filename),
            };
            socket.send(&reply.encode()).await?;
            return Err(e.into());
        }
    };

    let mut block: u16 = 1;
    let mut offset = 0usize;
    loop {
        let end = (offset + BLOCK_SIZE).min(data.len());
        let payload = data.slice(offset..end);
        let last = payload.len() < BLOCK_SIZE;
        send_block(&socket, block, payload).await?;

        if last {
            break;
        }
        offset = end;
        block = block.wrapping_add(1);
    }

    info!("sent {} ({} bytes) to {}", ctx.filename, data.len(), peer);
    Ok(())
}

/// Send one DATA packet and wait for its ACK, retransmitting on timeout
async fn send_block(socket: &UdpSocket, block: u16, payload: Bytes) -> Result<()> {
    let packet = TftpPacket::Data { block, payload }.encode();
    let mut buf = [0u8; 516];

    for _ in 0..MAX_RETRIES {
        socket.send(&packet).await?;
        let deadline = tokio::time::Instant::now() + TRANSFER_TIMEOUT;
        loop {
            let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => break,
            };
            match TftpPacket::decode(&buf[..len]) {
                Ok(TftpPacket::Ack { block: acked }) if acked == block => return Ok(()),
                Ok(TftpPacket::Error { code, message }) => {
                    return Err(K8sInitError::network(format!(
                        "client aborted transfer ({}): {}",
                        code, message
                    )));
                }
                // Duplicate ACKs for earlier blocks are ignored
                _ => continue,
            }
        }
    }

    Err(K8sInitError::network(format!(
        "no ack for block {} after {} attempts",
        block, MAX_RETRIES
    )))
}
