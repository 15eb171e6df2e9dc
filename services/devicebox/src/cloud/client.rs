//! Bounded-concurrency client for the cloud blob store.
//!
//! All requests run on a dedicated single-thread runtime so blocking spool
//! reads and slow HTTP never stall control-plane timers.  Six verbs are
//! served; uploads are capped at [`MAX_UPLOADS`] in flight and excess
//! uploads complete immediately with the distinguished `(0, "")` skip value,
//! which callers must treat as a non-retryable drop.
//!
//! `reset` tears the executor down without delivering results for queued or
//! in-flight requests (their futures resolve with [`CloudError::Dropped`])
//! and starts a fresh one; `shutdown` is the same without the restart.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Upload concurrency cap.
pub const MAX_UPLOADS: usize = 2;

/// Base URLs of the provider's RPC and content endpoints.
#[derive(Debug, Clone)]
pub struct CloudEndpoints {
    pub api_base: String,
    pub content_base: String,
}

impl Default for CloudEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://api.dropboxapi.com".to_owned(),
            content_base: "https://content.dropboxapi.com".to_owned(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The executor was reset or shut down before the request completed.
    /// Callers return early; the request outcome is unknowable.
    #[error("cloud request dropped by executor reset")]
    Dropped,
}

/// `(status, body)` as the provider returned it; status 0 stands for "no
/// HTTP exchange happened" (transport failure, unreadable local file, or the
/// upload-cap skip).
pub type CloudResponse = (u16, String);

#[derive(Debug)]
enum CloudVerb {
    Upload { src: PathBuf, dst: String },
    ListFolder { path: String, recursive: bool },
    ContinueList { cursor: String },
    LatestCursor { path: String, recursive: bool },
    DeletePath { path: String },
    DeleteBatch { paths: Vec<String> },
}

enum CloudCommand {
    SetToken(String),
    Request {
        verb: CloudVerb,
        reply: oneshot::Sender<CloudResponse>,
    },
    Shutdown(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap clonable request interface to the executor.  Handles outlive resets
/// harmlessly: requests against a torn-down executor resolve with
/// [`CloudError::Dropped`].
#[derive(Clone)]
pub struct CloudHandle {
    tx: mpsc::UnboundedSender<CloudCommand>,
}

impl CloudHandle {
    async fn request(&self, verb: CloudVerb) -> Result<CloudResponse, CloudError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CloudCommand::Request {
                verb,
                reply: reply_tx,
            })
            .map_err(|_| CloudError::Dropped)?;
        reply_rx.await.map_err(|_| CloudError::Dropped)
    }

    pub async fn upload(&self, src: PathBuf, dst: String) -> Result<CloudResponse, CloudError> {
        self.request(CloudVerb::Upload { src, dst }).await
    }

    pub async fn list_folder(
        &self,
        path: String,
        recursive: bool,
    ) -> Result<CloudResponse, CloudError> {
        self.request(CloudVerb::ListFolder { path, recursive }).await
    }

    pub async fn continue_list(&self, cursor: String) -> Result<CloudResponse, CloudError> {
        self.request(CloudVerb::ContinueList { cursor }).await
    }

    pub async fn latest_cursor(
        &self,
        path: String,
        recursive: bool,
    ) -> Result<CloudResponse, CloudError> {
        self.request(CloudVerb::LatestCursor { path, recursive })
            .await
    }

    pub async fn delete_path(&self, path: String) -> Result<CloudResponse, CloudError> {
        self.request(CloudVerb::DeletePath { path }).await
    }

    pub async fn delete_batch(&self, paths: Vec<String>) -> Result<CloudResponse, CloudError> {
        self.request(CloudVerb::DeleteBatch { paths }).await
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Owner of the cloud executor.  One per device controller.
pub struct CloudClient {
    endpoints: CloudEndpoints,
    tx: mpsc::UnboundedSender<CloudCommand>,
}

impl CloudClient {
    pub fn new(endpoints: CloudEndpoints) -> Self {
        let tx = spawn_executor(endpoints.clone());
        Self { endpoints, tx }
    }

    pub fn handle(&self) -> CloudHandle {
        CloudHandle {
            tx: self.tx.clone(),
        }
    }

    /// Install the account token used for all subsequent requests.
    pub fn set_token(&self, token: String) {
        let _ = self.tx.send(CloudCommand::SetToken(token));
    }

    /// Stop the executor, discard every queued and in-flight request, and
    /// start a fresh executor.  The token is cleared with the old executor.
    pub async fn reset(&mut self) {
        self.stop_executor().await;
        self.tx = spawn_executor(self.endpoints.clone());
    }

    /// Stop the executor for good.  Requests on surviving handles resolve
    /// with [`CloudError::Dropped`] from here on.
    pub async fn shutdown(&mut self) {
        self.stop_executor().await;
    }

    async fn stop_executor(&mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(CloudCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Executor thread
// ---------------------------------------------------------------------------

fn spawn_executor(endpoints: CloudEndpoints) -> mpsc::UnboundedSender<CloudCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    let spawned = std::thread::Builder::new()
        .name("cloud-io".to_owned())
        .spawn(move || executor_main(endpoints, rx));
    if let Err(e) = spawned {
        error!(error = %e, "failed to spawn cloud executor thread");
    }

    tx
}

fn executor_main(endpoints: CloudEndpoints, mut rx: mpsc::UnboundedReceiver<CloudCommand>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build cloud executor runtime");
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let http = reqwest::Client::new();
        let token = Rc::new(RefCell::new(String::new()));
        let uploads = Rc::new(Cell::new(0usize));

        while let Some(command) = rx.recv().await {
            match command {
                CloudCommand::SetToken(new_token) => {
                    *token.borrow_mut() = new_token;
                }
                CloudCommand::Request {
                    verb: CloudVerb::Upload { src, dst },
                    reply,
                } => {
                    if uploads.get() >= MAX_UPLOADS {
                        debug!(
                            src = %src.display(),
                            dst = %dst,
                            "too many simultaneous uploads, skipped"
                        );
                        let _ = reply.send((0, String::new()));
                        continue;
                    }
                    uploads.set(uploads.get() + 1);
                    let task_uploads = Rc::clone(&uploads);
                    let task_token = token.borrow().clone();
                    let task_http = http.clone();
                    let content_base = endpoints.content_base.clone();
                    tokio::task::spawn_local(async move {
                        let outcome =
                            run_upload(&task_http, &content_base, &task_token, &src, &dst).await;
                        task_uploads.set(task_uploads.get() - 1);
                        let _ = reply.send(outcome);
                    });
                }
                CloudCommand::Request { verb, reply } => {
                    let task_token = token.borrow().clone();
                    let task_http = http.clone();
                    let api_base = endpoints.api_base.clone();
                    tokio::task::spawn_local(async move {
                        let outcome = run_api(&task_http, &api_base, &task_token, verb).await;
                        let _ = reply.send(outcome);
                    });
                }
                CloudCommand::Shutdown(ack) => {
                    let _ = ack.send(());
                    break;
                }
            }
        }
        // Dropping the LocalSet cancels every in-flight request task; their
        // reply channels close and callers observe Dropped.
    });
}

async fn run_upload(
    http: &reqwest::Client,
    content_base: &str,
    token: &str,
    src: &std::path::Path,
    dst: &str,
) -> CloudResponse {
    debug!(src = %src.display(), dst = %dst, "upload");

    let data = match tokio::fs::read(src).await {
        Ok(data) => data,
        Err(e) => {
            warn!(src = %src.display(), error = %e, "upload source unreadable");
            return (0, String::new());
        }
    };

    let api_arg = serde_json::json!({
        "path": dst,
        "mode": "overwrite",
        "autorename": false,
        "mute": false,
    });

    let result = http
        .post(format!("{}/2/files/upload", content_base))
        .bearer_auth(token)
        .header("Dropbox-API-Arg", api_arg.to_string())
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(data)
        .send()
        .await;

    let outcome = finish_response(result).await;
    debug!(dst = %dst, status = outcome.0, "upload finished");
    outcome
}

async fn run_api(
    http: &reqwest::Client,
    api_base: &str,
    token: &str,
    verb: CloudVerb,
) -> CloudResponse {
    let (endpoint, body) = match &verb {
        CloudVerb::ListFolder { path, recursive } => (
            "/2/files/list_folder",
            serde_json::json!({
                "path": path,
                "recursive": recursive,
                "include_media_info": false,
                "include_deleted": false,
                "include_has_explicit_shared_members": false,
            }),
        ),
        CloudVerb::ContinueList { cursor } => (
            "/2/files/list_folder/continue",
            serde_json::json!({ "cursor": cursor }),
        ),
        CloudVerb::LatestCursor { path, recursive } => (
            "/2/files/list_folder/get_latest_cursor",
            serde_json::json!({
                "path": path,
                "recursive": recursive,
                "include_media_info": false,
                "include_deleted": false,
                "include_has_explicit_shared_members": false,
            }),
        ),
        CloudVerb::DeletePath { path } => {
            ("/2/files/delete", serde_json::json!({ "path": path }))
        }
        CloudVerb::DeleteBatch { paths } => {
            let entries: Vec<_> = paths
                .iter()
                .map(|path| serde_json::json!({ "path": path }))
                .collect();
            ("/2/files/delete_batch", serde_json::json!({ "entries": entries }))
        }
        CloudVerb::Upload { .. } => unreachable!("uploads dispatch separately"),
    };

    let result = http
        .post(format!("{}{}", api_base, endpoint))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await;

    let outcome = finish_response(result).await;
    debug!(endpoint, status = outcome.0, "cloud request finished");
    outcome
}

async fn finish_response(result: Result<reqwest::Response, reqwest::Error>) -> CloudResponse {
    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            (status, body)
        }
        Err(e) => {
            warn!(error = %e, "cloud transport failure");
            (0, String::new())
        }
    }
}
