// file: src/network/http/server.rs
// version: 1.0.0
// guid: 9c0d1e2f-3a4b-4c5d-8e6f-7a8b9c0d1e2f

//! Non-blocking HTTP control server

use crate::error::K8sInitError;
use crate::network::stop_requested;
use crate::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct HttpServer {
    addr: SocketAddr,
    router: Router,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            addr,
            router,
            started: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.local_addr.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Bind the listener and serve in the background
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("httpd already started");
            return Ok(());
        }

        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(K8sInitError::network(format!(
                    "cannot start http server on {}: {}",
                    self.addr, e
                )));
            }
        };
        let addr = listener.local_addr()?;
        if let Ok(mut guard) = self.local_addr.lock() {
            *guard = Some(addr);
        }
        info!("httpd listening on {}", addr);

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let router = self.router.clone();
        let handle = tokio::spawn(async move {
            let graceful = async move { stop_requested(&mut shutdown).await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("httpd stopped with error: {}", e);
            }
        });

        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *task = Some(handle);
        Ok(())
    }

    /// Shut down gracefully and wait for in-flight requests. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("httpd task failed: {}", e);
            }
            info!("httpd stopped");
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn test_server() -> HttpServer {
        let router = Router::new().route("/api/health", get(|| async { "ok" }));
        HttpServer::new("127.0.0.1:0".parse().unwrap(), router)
    }

    #[tokio::test]
    async fn test_start_serves_and_stop_releases() {
        let server = test_server();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let body = reqwest::get(format!("http://{}/api/health", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        server.stop().await;
        assert!(!server.is_started());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start_and_twice() {
        let server = test_server();
        server.stop().await;
        server.start().await.unwrap();
        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_resets_flag() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let router = Router::new();
        let server = HttpServer::new(taken.local_addr().unwrap(), router);

        assert!(server.start().await.is_err());
        assert!(!server.is_started());
    }
}
