//! Bridge between the media restreamer and the control plane.
//!
//! The external restreamer reports viewer-side edges: when the first reader
//! subscribes to a path the owning device is asked to push that source to
//! the restream URL, and when the last reader leaves the push is stopped.
//! The bridge also answers the restreamer's authentication and
//! authorisation callbacks from config.

use crate::control::ControlHandle;
use cl_config::{hash, ConfigQuery};
use cl_protocol::{DeviceId, SourceId, UserName};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Viewer-side edges reported by the restreamer.
#[derive(Debug, Clone)]
pub enum RestreamEvent {
    FirstReader { user: UserName, path: String },
    LastReader { path: String },
    RecorderConnected { path: String },
    RecorderDisconnected { path: String },
}

/// What a client is trying to do with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Access,
    Construct,
}

#[derive(Debug, Clone)]
struct PathInfo {
    device_id: DeviceId,
    source_id: SourceId,
    has_readers: bool,
    has_recorder: bool,
}

pub struct RestreamBridge {
    control: ControlHandle,
    config: Arc<dyn ConfigQuery>,
    /// `rtsps://host:port/`; the source id is appended per stream.
    restream_base: String,
    paths: HashMap<String, PathInfo>,
}

impl RestreamBridge {
    pub fn new(control: ControlHandle, config: Arc<dyn ConfigQuery>) -> Self {
        let settings = config.server_settings();
        let restream_base = format!("rtsps://{}:{}/", settings.host, settings.restream_port);
        Self {
            control,
            config,
            restream_base,
            paths: HashMap::new(),
        }
    }

    /// `/<source-id>/...` → source id.
    pub fn extract_source_id(path: &str) -> SourceId {
        path.trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or("")
            .to_owned()
    }

    /// Whether a request on `path` needs credentials.  Play on a source the
    /// anonymous user may access does not.
    pub fn authentication_required(&self, path: &str, record: bool) -> bool {
        let source_id = Self::extract_source_id(path);
        if source_id.is_empty() {
            return true;
        }

        if !record
            && self
                .config
                .find_user_source(&UserName::new(), &source_id)
                .is_some()
        {
            trace!(source_id = %source_id, "anonymous play allowed, no authentication");
            return false;
        }

        debug!(
            source_id = %source_id,
            mode = if record { "RECORD" } else { "PLAY" },
            "authentication required"
        );
        true
    }

    /// Password check against the stored salted hash.
    pub fn authenticate(&self, user: &UserName, password: &str) -> bool {
        let Some(found) = self.config.find_user(user) else {
            info!(user = %user, "user not found");
            return false;
        };

        if found.name.is_empty() {
            info!("anonymous user authenticated");
            return true;
        }

        if found.password_salt.is_empty() || found.password_hash.is_empty() {
            error!(user = %user, "user has empty salt or hash");
            return false;
        }

        if !hash::check_hash(
            found.hash_type,
            password,
            &found.password_salt,
            &found.password_hash,
        ) {
            error!(user = %user, "password hash check failed");
            return false;
        }

        debug!(user = %user, "user authenticated");
        true
    }

    /// Authorise `user` for `path`: play needs a user-source grant, record
    /// needs the name to be the owning device of the source.
    pub fn authorize(&self, user: &UserName, action: Action, path: &str, record: bool) -> bool {
        let source_id = Self::extract_source_id(path);
        if source_id.is_empty() {
            error!("source id is empty");
            return false;
        }

        let allow_play = self.config.find_user_source(user, &source_id).is_some();
        let allow_record = self.config.find_device_source(user, &source_id).is_some();
        if allow_play && allow_record {
            error!(name = %user, "user and device have the same name");
            return false;
        }
        if !allow_play && !allow_record {
            error!(source_id = %source_id, "unknown restream source");
            return false;
        }

        let authorized = match action {
            Action::Access | Action::Construct => {
                (!record && allow_play) || (record && allow_record)
            }
        };

        if authorized {
            debug!(source_id = %source_id, user = %user, "authorized");
        } else {
            error!(source_id = %source_id, user = %user, "NOT authorized");
        }
        authorized
    }

    pub async fn handle_event(&mut self, event: RestreamEvent) {
        match event {
            RestreamEvent::FirstReader { user, path } => self.first_reader(&user, &path).await,
            RestreamEvent::LastReader { path } => self.last_reader(&path).await,
            RestreamEvent::RecorderConnected { path } => self.set_recorder(&path, true),
            RestreamEvent::RecorderDisconnected { path } => self.set_recorder(&path, false),
        }
    }

    async fn first_reader(&mut self, user: &UserName, path: &str) {
        trace!(path = %path, "first reader connected");

        let source_id = Self::extract_source_id(path);
        let Some(play) = self.config.find_user_source(user, &source_id) else {
            error!(path = %path, user = %user, "no play source for path");
            return;
        };

        self.paths
            .entry(path.to_owned())
            .and_modify(|info| {
                info.has_readers = true;
                // Fill in identity for paths first seen via the recorder.
                info.device_id = play.device_id.clone();
                info.source_id = play.source_id.clone();
            })
            .or_insert_with(|| PathInfo {
                device_id: play.device_id.clone(),
                source_id: play.source_id.clone(),
                has_readers: true,
                has_recorder: false,
            });

        let destination = format!("{}{}", self.restream_base, play.source_id);
        self.control
            .request_stream(&play.device_id, play.source_id.clone(), destination)
            .await;
    }

    async fn last_reader(&mut self, path: &str) {
        trace!(path = %path, "last reader disconnected");

        let Some(info) = self.paths.get_mut(path) else {
            warn!(path = %path, "reader accounting for unknown path");
            return;
        };
        info.has_readers = false;

        let device_id = info.device_id.clone();
        let source_id = info.source_id.clone();
        self.control.stop_stream(&device_id, &source_id).await;
    }

    fn set_recorder(&mut self, path: &str, connected: bool) {
        match self.paths.get_mut(path) {
            Some(info) => info.has_recorder = connected,
            None if connected => {
                let source_id = Self::extract_source_id(path);
                // The recorder may beat the first reader to a fresh path; the
                // device id is filled in when a reader resolves it.
                self.paths.insert(
                    path.to_owned(),
                    PathInfo {
                        device_id: DeviceId::new(),
                        source_id,
                        has_readers: false,
                        has_recorder: true,
                    },
                );
            }
            None => warn!(path = %path, "recorder accounting for unknown path"),
        }
    }
}

/// Drive a bridge from a restreamer event channel until shutdown.
pub async fn run_bridge(
    mut bridge: RestreamBridge,
    mut events_rx: mpsc::UnboundedReceiver<RestreamEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(event) => bridge.handle_event(event).await,
                    None => break,
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!("restream bridge stopped");
}
