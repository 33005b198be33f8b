// file: src/network/http/api.rs
// version: 1.0.0
// guid: 8b9c0d1e-2f3a-4b4c-9d5e-6f7a8b9c0d1e

//! Control API routes

use crate::config::{InitSettings, InstallConfig};
use crate::error::K8sInitError;
use crate::installer::{InstallPipeline, ProgressSink};
use crate::network::setup::NetworkBringUp;
use crate::system::disk::DiskManager;
use crate::system::executor::CommandExecutor;
use crate::system::power::{PowerIntent, PowerStateMachine};
use crate::system::zfs::ZfsManager;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DECODE_ERROR_PREFIX: &str = "error: cannot decode json data err: ";
pub const INSTALL_FAILED: &str = "error: installation error";

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<dyn CommandExecutor>,
    pub settings: Arc<InitSettings>,
    pub installer: Arc<InstallPipeline>,
    pub power: Arc<PowerStateMachine>,
    /// Installed pool; empty on an unprovisioned node
    pub pool_name: String,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(K8sInitError),
}

impl From<K8sInitError> for ApiError {
    fn from(e: K8sInitError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            ApiError::Internal(e) => {
                error!("api request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the full router: API routes, boot image routes and the htdocs
/// fallback
pub fn router(state: ApiState, htdocs: PathBuf) -> Router {
    let boot_dir = state.settings.pool_boot_dir(&state.pool_name);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/disks", get(list_disks))
        .route("/api/zpools", get(list_pools))
        .route("/api/zpools/{pool}", get(get_pool))
        .route("/api/zpools/{pool}/datasets", get(list_datasets))
        .route("/api/zpools/{pool}/datasets/{*dataset}", get(get_dataset))
        .route("/api/network/interfaces", get(list_interfaces))
        .route("/api/network/tftp", get(chainload))
        .route_service(
            "/api/network/tftp/vmlinuz",
            ServeFile::new(boot_dir.join("vmlinuz")),
        )
        .route_service(
            "/api/network/tftp/initrd",
            ServeFile::new(boot_dir.join("initramfs")),
        )
        .route("/api/system/reboot", post(reboot))
        .route("/api/system/poweroff", post(poweroff))
        .route("/api/system/install", get(install))
        .fallback_service(ServeDir::new(htdocs))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn list_disks(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let disks = DiskManager::new(state.executor.as_ref()).list_disks().await?;
    Ok(ok(disks))
}

async fn list_pools(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let pools = ZfsManager::new(state.executor.as_ref()).list_pools().await?;
    Ok(ok(pools))
}

async fn get_pool(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let found = ZfsManager::new(state.executor.as_ref())
        .list_pools()
        .await?
        .into_iter()
        .find(|p| p.name == pool)
        .ok_or_else(|| ApiError::NotFound(format!("zpool {}", pool)))?;
    Ok(ok(found))
}

async fn list_datasets(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let zfs = ZfsManager::new(state.executor.as_ref());
    if !zfs.pool_exists(&pool).await? {
        return Err(ApiError::NotFound(format!("zpool {}", pool)));
    }
    Ok(ok(zfs.list_datasets(&pool).await?))
}

async fn get_dataset(
    State(state): State<ApiState>,
    Path((pool, dataset)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let zfs = ZfsManager::new(state.executor.as_ref());
    if !zfs.pool_exists(&pool).await? {
        return Err(ApiError::NotFound(format!("zpool {}", pool)));
    }
    // Accept both "boot" and "zp_k8s/boot"
    let full_name = format!("{}/{}", pool, dataset);
    let found = zfs
        .list_datasets(&pool)
        .await?
        .into_iter()
        .find(|d| d.name == dataset || d.name == full_name)
        .ok_or_else(|| ApiError::NotFound(format!("dataset {}", full_name)))?;
    Ok(ok(found))
}

async fn list_interfaces(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let links = NetworkBringUp::new(state.executor.as_ref())
        .interfaces_with_macs()
        .await?;
    Ok(ok(links))
}

/// Chainload script for iPXE clients, pointing back at the host they used
pub fn ipxe_script(host: &str, pool: &str) -> String {
    format!(
        "#!ipxe\n\
         echo loading kernel...\n\
         kernel http://{host}/api/network/tftp/vmlinuz k8sinit.role=node k8sinit.pool={pool}\n\
         echo loading initrd...\n\
         initrd http://{host}/api/network/tftp/initrd\n\
         boot\n"
    )
}

async fn chainload(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", state.settings.http_address, state.settings.http_port));
    debug!("ipxe script requested via {}", host);
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        ipxe_script(&host, &state.pool_name),
    )
        .into_response()
}

fn schedule_power(state: &ApiState, intent: PowerIntent) -> Json<serde_json::Value> {
    let delay = state.settings.power_delay();
    let power = Arc::clone(&state.power);
    info!("{} scheduled in {:?}", intent, delay);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        power.execute(intent).await;
    });
    Json(json!({
        "success": true,
        "data": format!("System will be {} in {} seconds", past_tense(intent), delay.as_secs()),
    }))
}

fn past_tense(intent: PowerIntent) -> &'static str {
    match intent {
        PowerIntent::Reboot => "rebooted",
        PowerIntent::Poweroff => "powered off",
    }
}

async fn reboot(State(state): State<ApiState>) -> Json<serde_json::Value> {
    schedule_power(&state, PowerIntent::Reboot)
}

async fn poweroff(State(state): State<ApiState>) -> Json<serde_json::Value> {
    schedule_power(&state, PowerIntent::Poweroff)
}

async fn install(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| install_session(socket, state))
}

/// Decode the first install message, formatting failures for the socket
pub fn decode_install_request(data: &[u8]) -> std::result::Result<InstallConfig, String> {
    serde_json::from_slice(data).map_err(|e| format!("{}{}", DECODE_ERROR_PREFIX, e))
}

async fn install_session(mut socket: WebSocket, state: ApiState) {
    let request = match socket.recv().await {
        Some(Ok(Message::Text(text))) => decode_install_request(text.as_str().as_bytes()),
        Some(Ok(Message::Binary(data))) => decode_install_request(&data),
        Some(Ok(other)) => {
            debug!("unexpected install message: {:?}", other);
            return;
        }
        Some(Err(e)) => {
            warn!("install socket failed: {}", e);
            return;
        }
        None => return,
    };

    let config = match request {
        Ok(config) => config,
        Err(message) => {
            error!("{}", message);
            let _ = socket.send(Message::Text(message.into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (sink, mut lines) = ProgressSink::channel(64);
    let installer = Arc::clone(&state.installer);
    let job = tokio::spawn(async move { installer.run(config, sink).await });

    while let Some(line) = lines.recv().await {
        if socket.send(Message::Text(line.into())).await.is_err() {
            warn!("install listener disconnected");
            break;
        }
    }
    drop(lines);

    let succeeded = matches!(job.await, Ok(Ok(_)));
    if !succeeded {
        let _ = socket.send(Message::Text(INSTALL_FAILED.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::system::executor::scripted::ScriptedExecutor;
    use crate::system::power::tests::RecordingControl;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub(crate) fn test_state(root: &TempDir, exec: Arc<ScriptedExecutor>) -> ApiState {
        let mut settings = InitSettings::default();
        settings.root_dir = root.path().to_path_buf();
        settings.http_port = 0;
        settings.power_delay_secs = 3600;
        let settings = Arc::new(settings);
        let store = Arc::new(ConfigStore::new(root.path()));
        let power = Arc::new(PowerStateMachine::new(
            exec.clone(),
            store.clone(),
            settings.clone(),
            Box::new(RecordingControl::default()),
        ));
        ApiState {
            executor: exec.clone(),
            settings: settings.clone(),
            installer: Arc::new(InstallPipeline::new(exec, store, settings)),
            power,
            pool_name: "zp_k8s".to_string(),
        }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .header(header::HOST, "10.10.0.1:8000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn app(root: &TempDir, exec: Arc<ScriptedExecutor>) -> Router {
        let htdocs = root.path().join("htdocs");
        std::fs::create_dir_all(&htdocs).unwrap();
        std::fs::write(htdocs.join("index.html"), "<h1>k8sinit</h1>").unwrap();
        router(test_state(root, exec), htdocs)
    }

    #[tokio::test]
    async fn test_health() {
        let root = TempDir::new().unwrap();
        let (status, body) = get_body(app(&root, Arc::new(ScriptedExecutor::new())), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_ipxe_script_uses_request_host() {
        let root = TempDir::new().unwrap();
        let (status, body) = get_body(app(&root, Arc::new(ScriptedExecutor::new())), "/api/network/tftp").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("#!ipxe\n"));
        assert!(body.contains(
            "kernel http://10.10.0.1:8000/api/network/tftp/vmlinuz k8sinit.role=node k8sinit.pool=zp_k8s"
        ));
        assert!(body.contains("initrd http://10.10.0.1:8000/api/network/tftp/initrd"));
    }

    #[tokio::test]
    async fn test_boot_images_served_from_pool() {
        let root = TempDir::new().unwrap();
        let boot = root.path().join("zp_k8s/boot");
        std::fs::create_dir_all(&boot).unwrap();
        std::fs::write(boot.join("initramfs"), "INITRD").unwrap();

        let (status, body) =
            get_body(app(&root, Arc::new(ScriptedExecutor::new())), "/api/network/tftp/initrd").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "INITRD");
    }

    #[tokio::test]
    async fn test_pool_lookup() {
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("zpool list", "zp_k8s\t1000\t100\t900\tONLINE\n");

        let (status, body) = get_body(app(&root, exec.clone()), "/api/zpools/zp_k8s").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""success":true"#));
        assert!(body.contains(r#""health":"ONLINE""#));

        let (status, _) = get_body(app(&root, exec), "/api/zpools/tank").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dataset_lookup_accepts_short_name() {
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("zpool list", "zp_k8s\t1000\t100\t900\tONLINE\n");
        exec.on(
            "zfs list",
            "zp_k8s\t100\t900\t/zp_k8s\nzp_k8s/boot\t50\t900\t/zp_k8s/boot\n",
        );

        let (status, body) = get_body(app(&root, exec), "/api/zpools/zp_k8s/datasets/boot").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""name":"zp_k8s/boot""#));
    }

    #[tokio::test]
    async fn test_tool_failure_is_internal_error() {
        let root = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("lsblk", "lsblk: not found");

        let (status, body) = get_body(app(&root, exec), "/api/disks").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("lsblk"));
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let root = TempDir::new().unwrap();
        let (status, body) = get_body(app(&root, Arc::new(ScriptedExecutor::new())), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>k8sinit</h1>");

        let (status, _) = get_body(app(&root, Arc::new(ScriptedExecutor::new())), "/missing.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reboot_answers_immediately() {
        let root = TempDir::new().unwrap();
        let response = app(&root, Arc::new(ScriptedExecutor::new()))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/system/reboot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("rebooted in 3600 seconds"));
    }

    #[test]
    fn test_decode_install_request() {
        let err = decode_install_request(b"{not json").unwrap_err();
        assert!(err.starts_with(DECODE_ERROR_PREFIX));

        let body = serde_json::to_vec(&crate::config::tests::sample_config()).unwrap();
        assert_eq!(decode_install_request(&body).unwrap().disk, "/dev/sda");
    }
}
