//! Device controller: owns one handler group per configured source.
//!
//! Runs as a single actor task.  Commands arrive over a channel and every
//! completion is acknowledged, which serialises all state changes: config
//! loads, stream dispatch, resets, the periodic eviction sweep, upload
//! hand-off for finished segments, and the strict teardown order
//! recorder → cloud folder → streamer.  The recorder must stop producing
//! before the folder stops tracking, and the streamer drains last because
//! its teardown may touch the pipeline the recorder shares.

use crate::cloud::{CloudClient, CloudError, CloudFolder};
use crate::config::{SourceConfig, Tuning};
use crate::media::{MediaFactory, RecordedFile, StreamEvent};
use cl_protocol::{ClientConfig, RequestStream, SourceId, StopStream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Public interface
// ---------------------------------------------------------------------------

/// Reports from the controller to the control-channel client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    StreamStatus { source_id: SourceId, success: bool },
}

enum ControllerCommand {
    LoadConfig(ClientConfig, oneshot::Sender<()>),
    UpdateConfig(ClientConfig, oneshot::Sender<()>),
    StreamRequested(RequestStream),
    StopStream(StopStream),
    Reset(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    ActiveSources(oneshot::Sender<Vec<SourceId>>),
}

#[derive(Debug, thiserror::Error)]
#[error("controller task is gone")]
pub struct ControllerClosed;

/// Cheap handle to the controller actor.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    async fn acked<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> Result<T, ControllerClosed> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(build(done_tx))
            .await
            .map_err(|_| ControllerClosed)?;
        done_rx.await.map_err(|_| ControllerClosed)
    }

    /// Apply a config.  A previously loaded config is reset first.
    pub async fn load_config(&self, config: ClientConfig) -> Result<(), ControllerClosed> {
        self.acked(|done| ControllerCommand::LoadConfig(config, done))
            .await
    }

    /// Currently equivalent to reset + load.
    pub async fn update_config(&self, config: ClientConfig) -> Result<(), ControllerClosed> {
        self.acked(|done| ControllerCommand::UpdateConfig(config, done))
            .await
    }

    /// Dispatch a stream request.  The outcome arrives as a
    /// [`ControllerEvent::StreamStatus`].
    pub async fn stream_requested(&self, request: RequestStream) -> Result<(), ControllerClosed> {
        self.tx
            .send(ControllerCommand::StreamRequested(request))
            .await
            .map_err(|_| ControllerClosed)
    }

    pub async fn stop_stream(&self, request: StopStream) -> Result<(), ControllerClosed> {
        self.tx
            .send(ControllerCommand::StopStream(request))
            .await
            .map_err(|_| ControllerClosed)
    }

    /// Tear every handler group down and clear the loaded config.
    pub async fn reset(&self) -> Result<(), ControllerClosed> {
        self.acked(ControllerCommand::Reset).await
    }

    /// Tear down and stop the actor.
    pub async fn shutdown(&self) -> Result<(), ControllerClosed> {
        self.acked(ControllerCommand::Shutdown).await
    }

    /// Ids of sources with live handler groups, sorted.
    pub async fn active_sources(&self) -> Result<Vec<SourceId>, ControllerClosed> {
        self.acked(ControllerCommand::ActiveSources).await
    }
}

/// Start the controller actor.  Returns its handle and the event stream the
/// control-channel client forwards to the server.
pub fn spawn_controller(
    factory: Arc<dyn MediaFactory>,
    tuning: Tuning,
) -> (ControllerHandle, mpsc::UnboundedReceiver<ControllerEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (files_tx, files_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();

    let controller = Controller {
        factory,
        cloud: CloudClient::new(tuning.cloud.clone()),
        tuning,
        groups: HashMap::new(),
        loaded: false,
        events_tx,
        files_tx,
        status_tx,
    };
    tokio::spawn(controller.run(cmd_rx, files_rx, status_rx));

    (ControllerHandle { tx: cmd_tx }, events_rx)
}

// ---------------------------------------------------------------------------
// Handler group
// ---------------------------------------------------------------------------

/// The per-source handler triple.
struct SourceGroup {
    source: SourceConfig,
    recorder: Box<dyn crate::media::Recorder>,
    streamer: Box<dyn crate::media::Streamer>,
    folder: Option<CloudFolder>,
}

impl SourceGroup {
    /// Strict teardown order: recorder, cloud folder, streamer.
    async fn shutdown(mut self) {
        let source_id = self.source.id.clone();
        self.recorder.shutdown().await;
        debug!(source_id = %source_id, "recorder shut down");
        if let Some(mut folder) = self.folder.take() {
            folder.shutdown().await;
            debug!(source_id = %source_id, "cloud folder shut down");
        }
        self.streamer.shutdown().await;
        debug!(source_id = %source_id, "streamer shut down");
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

struct Controller {
    factory: Arc<dyn MediaFactory>,
    tuning: Tuning,
    cloud: CloudClient,
    groups: HashMap<SourceId, SourceGroup>,
    loaded: bool,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    files_tx: mpsc::UnboundedSender<RecordedFile>,
    status_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Controller {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ControllerCommand>,
        mut files_rx: mpsc::UnboundedReceiver<RecordedFile>,
        mut status_rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.tuning.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if let Flow::Stop = self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            self.stop_groups().await;
                            self.cloud.shutdown().await;
                            break;
                        }
                    }
                }
                Some(file) = files_rx.recv() => self.file_ready(file),
                Some(event) = status_rx.recv() => {
                    let _ = self.events_tx.send(ControllerEvent::StreamStatus {
                        source_id: event.source_id,
                        success: event.success,
                    });
                }
                _ = sweep.tick() => self.sweep().await,
            }
        }
        debug!("controller stopped");
    }

    async fn handle_command(&mut self, command: ControllerCommand) -> Flow {
        match command {
            ControllerCommand::LoadConfig(config, done) => {
                self.load_config(config).await;
                let _ = done.send(());
            }
            ControllerCommand::UpdateConfig(config, done) => {
                debug!("config update, reloading");
                self.load_config(config).await;
                let _ = done.send(());
            }
            ControllerCommand::StreamRequested(request) => {
                match self.groups.get_mut(&request.source_id) {
                    Some(group) => {
                        group
                            .streamer
                            .stream(request.destination, self.status_tx.clone());
                    }
                    None => {
                        warn!(source_id = %request.source_id, "stream requested for unknown source");
                        let _ = self.events_tx.send(ControllerEvent::StreamStatus {
                            source_id: request.source_id,
                            success: false,
                        });
                    }
                }
            }
            ControllerCommand::StopStream(request) => {
                match self.groups.get_mut(&request.source_id) {
                    Some(group) => group.streamer.stop_stream(),
                    None => {
                        warn!(source_id = %request.source_id, "stop requested for unknown source")
                    }
                }
            }
            ControllerCommand::Reset(done) => {
                self.reset().await;
                let _ = done.send(());
            }
            ControllerCommand::Shutdown(done) => {
                self.stop_groups().await;
                self.cloud.shutdown().await;
                let _ = done.send(());
                return Flow::Stop;
            }
            ControllerCommand::ActiveSources(reply) => {
                let mut ids: Vec<SourceId> = self.groups.keys().cloned().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
        }
        Flow::Continue
    }

    async fn load_config(&mut self, config: ClientConfig) {
        if self.loaded {
            self.reset().await;
        }

        self.cloud.set_token(config.cloud.token.clone());

        for wire in &config.sources {
            if self.groups.contains_key(&wire.id) {
                warn!(source_id = %wire.id, "duplicate source in config, skipped");
                continue;
            }
            let source = match SourceConfig::from_wire(wire, &self.tuning.spool_root) {
                Ok(source) => source,
                Err(e) => {
                    warn!(source_id = %wire.id, error = %e, "source setup failed, skipped");
                    continue;
                }
            };

            let mut recorder = self.factory.recorder(&source);
            let streamer = self.factory.streamer(&source);
            let folder = if source.cloud_max_bytes > 0 {
                recorder.start(self.files_tx.clone());
                let mut folder = CloudFolder::new(self.cloud.handle(), self.tuning.poll_interval);
                folder.start_sync(source.cloud_archive_path.clone());
                Some(folder)
            } else {
                None
            };

            info!(
                source_id = %source.id,
                cloud_max_bytes = source.cloud_max_bytes,
                "source handlers started"
            );
            self.groups.insert(source.id.clone(), SourceGroup {
                source,
                recorder,
                streamer,
                folder,
            });
        }

        self.loaded = true;
    }

    async fn reset(&mut self) {
        self.stop_groups().await;
        self.cloud.reset().await;
        self.loaded = false;
    }

    async fn stop_groups(&mut self) {
        for (source_id, group) in std::mem::take(&mut self.groups) {
            debug!(source_id = %source_id, "shutting down source handlers");
            group.shutdown().await;
        }
    }

    /// Hand a finished segment to the cloud: upload, and remove the local
    /// file only when the provider confirmed it.
    fn file_ready(&self, file: RecordedFile) {
        let Some(group) = self.groups.get(&file.source_id) else {
            return;
        };
        if group.source.cloud_max_bytes == 0 {
            return;
        }

        let local = file.dir.join(&file.name);
        let remote = format!("{}{}", group.source.cloud_archive_path, file.name);
        let cloud = self.cloud.handle();
        tokio::spawn(async move {
            match cloud.upload(local.clone(), remote.clone()).await {
                Ok((200, _)) => {
                    debug!(remote = %remote, "segment uploaded");
                    if let Err(e) = tokio::fs::remove_file(&local).await {
                        warn!(local = %local.display(), error = %e, "uploaded segment not removed");
                    }
                }
                Ok((status, _)) => {
                    warn!(
                        remote = %remote,
                        status,
                        "upload did not succeed, segment left for retry"
                    );
                }
                Err(CloudError::Dropped) => {}
            }
        });
    }

    async fn sweep(&self) {
        for group in self.groups.values() {
            if group.source.cloud_max_bytes == 0 {
                continue;
            }
            if let Some(folder) = &group.folder {
                folder.shrink_to(group.source.cloud_max_bytes).await;
            }
        }
    }
}
