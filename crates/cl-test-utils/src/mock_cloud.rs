//! Mock cloud provider.
//!
//! Serves the six provider endpoints over an in-memory append-only change
//! log.  `list_folder` replays the log from the start; `continue` replays
//! from the cursor, so deletions appear as `deleted` entries exactly like
//! the real provider's incremental listing.  Upload latency and listing
//! page size are adjustable per test.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct CloudState {
    /// Append-only listing entries (`file` and `deleted`).
    log: Vec<Value>,
    /// Destination paths of received uploads, in arrival order.
    uploads: Vec<String>,
    delete_batches: Vec<Vec<String>>,
    upload_delay: Duration,
    page_size: Option<usize>,
}

impl CloudState {
    fn page(&self, from: usize) -> Value {
        let len = self.log.len();
        let end = match self.page_size {
            Some(size) => (from + size).min(len),
            None => len,
        };
        json!({
            "entries": self.log[from.min(len)..end],
            "cursor": end.to_string(),
            "has_more": end < len,
        })
    }
}

type SharedState = Arc<Mutex<CloudState>>;

/// A mock provider instance bound to a random localhost port.
pub struct MockCloudApi {
    addr: SocketAddr,
    state: SharedState,
    _task: tokio::task::JoinHandle<()>,
}

impl MockCloudApi {
    pub async fn start() -> Self {
        let state: SharedState = Arc::default();

        let router = Router::new()
            .route("/2/files/upload", post(upload))
            .route("/2/files/list_folder", post(list_folder))
            .route("/2/files/list_folder/continue", post(continue_list))
            .route(
                "/2/files/list_folder/get_latest_cursor",
                post(latest_cursor),
            )
            .route("/2/files/delete", post(delete_path))
            .route("/2/files/delete_batch", post(delete_batch))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock cloud");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            addr,
            state,
            _task: task,
        }
    }

    /// Base URL usable as both the RPC and content endpoint.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Seed a `file` entry into the listing log.
    pub async fn add_file(&self, path: &str, server_modified: &str, size: u64) {
        self.state.lock().await.log.push(json!({
            ".tag": "file",
            "path_display": path,
            "server_modified": server_modified,
            "size": size,
        }));
    }

    /// Seed a `deleted` entry into the listing log.
    pub async fn mark_deleted(&self, path: &str) {
        self.state.lock().await.log.push(json!({
            ".tag": "deleted",
            "path_display": path,
        }));
    }

    pub async fn uploads(&self) -> Vec<String> {
        self.state.lock().await.uploads.clone()
    }

    pub async fn delete_batches(&self) -> Vec<Vec<String>> {
        self.state.lock().await.delete_batches.clone()
    }

    pub async fn set_upload_delay(&self, delay: Duration) {
        self.state.lock().await.upload_delay = delay;
    }

    pub async fn set_page_size(&self, size: usize) {
        self.state.lock().await.page_size = Some(size);
    }
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("Bearer "))
        .unwrap_or(false)
}

async fn upload(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }

    let Some(path) = headers
        .get("Dropbox-API-Arg")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|arg| arg["path"].as_str().map(str::to_owned))
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "bad api arg"})),
        );
    };

    let delay = state.lock().await.upload_delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let modified = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut locked = state.lock().await;
    locked.uploads.push(path.clone());
    locked.log.push(json!({
        ".tag": "file",
        "path_display": path,
        "server_modified": modified,
        "size": body.len() as u64,
    }));

    (
        StatusCode::OK,
        Json(json!({"path_display": path, "size": body.len() as u64})),
    )
}

async fn list_folder(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(_request): Json<Value>,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }
    let locked = state.lock().await;
    (StatusCode::OK, Json(locked.page(0)))
}

async fn continue_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }
    let Some(from) = request["cursor"]
        .as_str()
        .and_then(|cursor| cursor.parse::<usize>().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "bad cursor"})),
        );
    };
    let locked = state.lock().await;
    (StatusCode::OK, Json(locked.page(from)))
}

async fn latest_cursor(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(_request): Json<Value>,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }
    let locked = state.lock().await;
    (
        StatusCode::OK,
        Json(json!({"cursor": locked.log.len().to_string()})),
    )
}

async fn delete_path(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }
    let Some(path) = request["path"].as_str().map(str::to_owned) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "bad path"})));
    };
    let mut locked = state.lock().await;
    locked.log.push(json!({
        ".tag": "deleted",
        "path_display": path,
    }));
    (StatusCode::OK, Json(json!({"path_display": path})))
}

async fn delete_batch(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }
    let Some(entries) = request["entries"].as_array() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "bad entries"})),
        );
    };
    let paths: Vec<String> = entries
        .iter()
        .filter_map(|entry| entry["path"].as_str().map(str::to_owned))
        .collect();

    let mut locked = state.lock().await;
    for path in &paths {
        locked.log.push(json!({
            ".tag": "deleted",
            "path_display": path,
        }));
    }
    locked.delete_batches.push(paths);
    (StatusCode::OK, Json(json!({".tag": "complete"})))
}
