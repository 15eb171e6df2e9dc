//! Local mirror of one remote cloud folder.
//!
//! The mirror keeps a path-keyed item set, an index ordered by the
//! provider's `server_modified` timestamp (ties stay in arrival order), and
//! a running byte total.  A poll task follows the provider's listing cursor
//! and applies `file` / `deleted` entries as they arrive; eviction walks the
//! index oldest-first and asks the provider to delete a batch, leaving local
//! accounting to the `deleted` entries of a later listing.

use crate::cloud::client::{CloudError, CloudHandle};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Provider listing schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListEntry {
    #[serde(rename = ".tag")]
    pub tag: String,
    #[serde(default)]
    pub path_display: String,
    #[serde(default)]
    pub server_modified: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    entries: Vec<ListEntry>,
    cursor: String,
    has_more: bool,
}

fn parse_modified(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Folder state
// ---------------------------------------------------------------------------

/// The mirrored folder contents.
///
/// Invariants: `total_bytes` equals the sum of item sizes, the index holds
/// exactly one entry per item, and the index is sorted ascending by modified
/// timestamp.
#[derive(Debug, Default)]
pub struct FolderState {
    items: HashMap<String, (DateTime<Utc>, u64)>,
    index: Vec<(DateTime<Utc>, String)>,
    total_bytes: u64,
}

impl FolderState {
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item paths in index order (oldest first).
    pub fn paths_oldest_first(&self) -> Vec<String> {
        self.index.iter().map(|(_, path)| path.clone()).collect()
    }

    /// Apply one page of listing entries.
    pub fn apply_entries(&mut self, entries: &[ListEntry]) {
        for entry in entries {
            match entry.tag.as_str() {
                "file" => {
                    let Some(modified) = parse_modified(&entry.server_modified) else {
                        warn!(
                            path = %entry.path_display,
                            raw = %entry.server_modified,
                            "unparsable server_modified, entry ignored"
                        );
                        continue;
                    };
                    self.insert(entry.path_display.clone(), modified, entry.size);
                }
                "deleted" => self.remove(&entry.path_display),
                "folder" => {}
                other => debug!(tag = %other, "unhandled listing entry tag"),
            }
        }

        debug_assert!(self.index.windows(2).all(|w| w[0].0 <= w[1].0));
        debug_assert_eq!(self.index.len(), self.items.len());
        debug_assert_eq!(
            self.total_bytes,
            self.items.values().map(|(_, size)| size).sum::<u64>()
        );
    }

    fn insert(&mut self, path: String, modified: DateTime<Utc>, size: u64) {
        self.remove(&path);

        // Upper-bound insertion keeps equal timestamps in arrival order.
        let at = self.index.partition_point(|(t, _)| *t <= modified);
        self.index.insert(at, (modified, path.clone()));
        self.items.insert(path, (modified, size));
        self.total_bytes += size;
    }

    fn remove(&mut self, path: &str) {
        let Some((modified, size)) = self.items.remove(path) else {
            return;
        };
        self.total_bytes -= size;

        let start = self.index.partition_point(|(t, _)| *t < modified);
        let position = self.index[start..]
            .iter()
            .take_while(|(t, _)| *t == modified)
            .position(|(_, p)| p == path);
        match position {
            Some(offset) => {
                self.index.remove(start + offset);
            }
            None => {
                debug_assert!(false, "item missing from index");
                error!(path = %path, "folder index out of step with item set");
            }
        }
    }

    /// Oldest-first delete list that brings the total to `max_bytes` or
    /// below.  Empty when already at or under the cap.
    pub fn removal_plan(&self, max_bytes: u64) -> Vec<String> {
        if self.total_bytes <= max_bytes {
            return Vec::new();
        }

        let mut overage = self.total_bytes - max_bytes;
        let mut plan = Vec::new();
        for (_, path) in &self.index {
            plan.push(path.clone());
            let (_, size) = self.items[path];
            // This entry covers the rest of the overage once its size
            // reaches it; keep walking only while overage stays strictly
            // greater.
            if overage <= size {
                break;
            }
            overage -= size;
        }
        plan
    }
}

// ---------------------------------------------------------------------------
// Cloud folder
// ---------------------------------------------------------------------------

/// One mirrored folder plus its poll task.  Created per cloud-enabled
/// source on config load, shut down on reset.
pub struct CloudFolder {
    state: Arc<Mutex<FolderState>>,
    cloud: CloudHandle,
    poll_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CloudFolder {
    pub fn new(cloud: CloudHandle, poll_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(FolderState::default())),
            cloud,
            poll_interval,
            shutdown_tx,
            task: None,
        }
    }

    /// Begin mirroring `path`: one full recursive listing, then incremental
    /// cursor polls every poll interval.
    pub fn start_sync(&mut self, path: String) {
        debug!(path = %path, "start folder sync");

        let state = Arc::clone(&self.state);
        let cloud = self.cloud.clone();
        let interval = self.poll_interval;
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.task = Some(tokio::spawn(run_sync(
            path,
            state,
            cloud,
            interval,
            shutdown_rx,
        )));
    }

    pub async fn total_bytes(&self) -> u64 {
        self.state.lock().await.total_bytes()
    }

    /// Ask the provider to delete the oldest entries until the folder fits
    /// in `max_bytes`.  No-op at or under the cap.  Local state is left for
    /// the next incremental listing to reconcile.
    pub async fn shrink_to(&self, max_bytes: u64) {
        let plan = self.state.lock().await.removal_plan(max_bytes);
        if plan.is_empty() {
            return;
        }

        debug!(entries = plan.len(), max_bytes, "evicting oldest cloud entries");
        let cloud = self.cloud.clone();
        tokio::spawn(async move {
            match cloud.delete_batch(plan).await {
                Ok((200, _)) => {}
                Ok((status, body)) => {
                    warn!(status, body = %body, "delete batch failed");
                }
                Err(CloudError::Dropped) => {}
            }
        });
    }

    pub fn active(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the poll task.  In-flight listing responses are discarded.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_sync(
    path: String,
    state: Arc<Mutex<FolderState>>,
    cloud: CloudHandle,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (status, body) = match cloud.list_folder(path.clone(), true).await {
        Ok(response) => response,
        Err(CloudError::Dropped) => return,
    };
    if *shutdown_rx.borrow() {
        return;
    }
    if status != 200 {
        error!(path = %path, status, body = %body, "list folder failed");
        return;
    }

    let Some(mut page) = apply_page(&state, &body).await else {
        return;
    };

    loop {
        // Drain queued pages before going idle.
        while page.has_more {
            if *shutdown_rx.borrow() {
                return;
            }
            let (status, body) = match cloud.continue_list(page.cursor.clone()).await {
                Ok(response) => response,
                Err(CloudError::Dropped) => return,
            };
            if *shutdown_rx.borrow() {
                return;
            }
            if status != 200 {
                warn!(status, "continue listing failed, retrying next cycle");
                break;
            }
            match apply_page(&state, &body).await {
                Some(next) => page = next,
                None => return,
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let (status, body) = match cloud.continue_list(page.cursor.clone()).await {
            Ok(response) => response,
            Err(CloudError::Dropped) => return,
        };
        if *shutdown_rx.borrow() {
            return;
        }
        if status != 200 {
            warn!(status, "continue listing failed, retrying next cycle");
            continue;
        }
        match apply_page(&state, &body).await {
            Some(next) => page = next,
            None => return,
        }
    }
}

struct PageCursor {
    cursor: String,
    has_more: bool,
}

async fn apply_page(state: &Mutex<FolderState>, body: &str) -> Option<PageCursor> {
    let page: ListPage = match serde_json::from_str(body) {
        Ok(page) => page,
        Err(e) => {
            error!(error = %e, "malformed listing response, folder sync stopped");
            return None;
        }
    };

    state.lock().await.apply_entries(&page.entries);

    Some(PageCursor {
        cursor: page.cursor,
        has_more: page.has_more,
    })
}
