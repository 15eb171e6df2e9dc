//! Media handler lifecycle interfaces and their process-backed
//! implementations.
//!
//! The actual pipeline (capture, parsing, muxing, publishing) is an external
//! concern; this module wraps it behind two small lifecycle traits.  The
//! production implementations run the pipeline as child processes: the
//! recorder keeps a segmenter writing into a per-source spool directory and
//! reports each settled file, the streamer runs one publisher process per
//! requested destination and reports its fate.

use crate::config::SourceConfig;
use async_trait::async_trait;
use cl_protocol::{SourceId, StreamDst};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A finished segment in the spool directory.
#[derive(Debug, Clone)]
pub struct RecordedFile {
    pub source_id: SourceId,
    pub dir: PathBuf,
    pub name: String,
}

/// A streamer outcome report.  `success = true` once the publisher is
/// playing; `success = false` on spawn failure, error, or end of stream.
/// A failure may follow an earlier success for the same request.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub source_id: SourceId,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Lifecycle traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Recorder: Send + Sync {
    /// Start producing segments, reporting each settled file on `files`.
    fn start(&mut self, files: mpsc::UnboundedSender<RecordedFile>);

    fn active(&self) -> bool;

    /// Stop producing and return once the handler has fully unwound.
    async fn shutdown(&mut self);
}

#[async_trait]
pub trait Streamer: Send + Sync {
    /// Begin publishing to `destination`, reporting outcomes on `status`.
    /// A repeat request for an already-active publisher re-acknowledges
    /// with success and changes nothing.
    fn stream(&mut self, destination: StreamDst, status: mpsc::UnboundedSender<StreamEvent>);

    fn stop_stream(&mut self);

    fn active(&self) -> bool;

    async fn shutdown(&mut self);
}

/// Builds the handler pair for one source.
pub trait MediaFactory: Send + Sync {
    fn recorder(&self, source: &SourceConfig) -> Box<dyn Recorder>;
    fn streamer(&self, source: &SourceConfig) -> Box<dyn Streamer>;
}

// ---------------------------------------------------------------------------
// Pipeline command templates
// ---------------------------------------------------------------------------

/// An external pipeline invocation with `{placeholder}` substitution.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    fn render(&self, vars: &[(&str, String)]) -> (String, Vec<String>) {
        let substitute = |raw: &str| {
            let mut rendered = raw.to_owned();
            for (key, value) in vars {
                rendered = rendered.replace(&format!("{{{key}}}"), value);
            }
            rendered
        };
        (
            substitute(&self.program),
            self.args.iter().map(|arg| substitute(arg)).collect(),
        )
    }
}

/// Process-backed factory with ffmpeg defaults.
#[derive(Debug, Clone)]
pub struct ProcessMediaFactory {
    pub recorder_command: CommandTemplate,
    pub streamer_command: CommandTemplate,
    pub spool_settle: Duration,
    pub spool_poll: Duration,
    pub upload_retry: Duration,
}

impl ProcessMediaFactory {
    pub fn new(tuning: &crate::config::Tuning) -> Self {
        Self {
            recorder_command: CommandTemplate {
                program: "ffmpeg".to_owned(),
                args: [
                    "-nostdin",
                    "-loglevel",
                    "error",
                    "-rtsp_transport",
                    "tcp",
                    "-i",
                    "{uri}",
                    "-c",
                    "copy",
                    "-f",
                    "segment",
                    "-segment_time",
                    "60",
                    "-reset_timestamps",
                    "1",
                    "{spool_dir}/%010d.mp4",
                ]
                .map(str::to_owned)
                .to_vec(),
            },
            streamer_command: CommandTemplate {
                program: "ffmpeg".to_owned(),
                args: [
                    "-nostdin",
                    "-loglevel",
                    "error",
                    "-rtsp_transport",
                    "tcp",
                    "-i",
                    "{uri}",
                    "-c",
                    "copy",
                    "-f",
                    "rtsp",
                    "{dst}",
                ]
                .map(str::to_owned)
                .to_vec(),
            },
            spool_settle: tuning.spool_settle,
            spool_poll: tuning.spool_poll,
            upload_retry: tuning.upload_retry,
        }
    }
}

impl MediaFactory for ProcessMediaFactory {
    fn recorder(&self, source: &SourceConfig) -> Box<dyn Recorder> {
        Box::new(SpoolRecorder::new(
            source.clone(),
            self.recorder_command.clone(),
            self.spool_settle,
            self.spool_poll,
            self.upload_retry,
        ))
    }

    fn streamer(&self, source: &SourceConfig) -> Box<dyn Streamer> {
        Box::new(ProcessStreamer::new(
            source.clone(),
            self.streamer_command.clone(),
        ))
    }
}

fn source_vars(source: &SourceConfig) -> Vec<(&'static str, String)> {
    vec![
        ("source_id", source.id.clone()),
        ("uri", source.uri.clone()),
        ("user", source.user.clone()),
        ("password", source.password.clone()),
        ("spool_dir", source.spool_dir.display().to_string()),
    ]
}

// ---------------------------------------------------------------------------
// Spool recorder
// ---------------------------------------------------------------------------

/// Runs the segmenter process and offers settled spool files for upload.
///
/// A file counts as settled once it has sat unmodified for the settle
/// period.  Offered files that are still on disk after the retry period are
/// offered again, which covers failed and skipped uploads.
pub struct SpoolRecorder {
    source: SourceConfig,
    command: CommandTemplate,
    settle: Duration,
    poll: Duration,
    retry: Duration,
    shutdown_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SpoolRecorder {
    pub fn new(
        source: SourceConfig,
        command: CommandTemplate,
        settle: Duration,
        poll: Duration,
        retry: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source,
            command,
            settle,
            poll,
            retry,
            shutdown_tx,
            task: None,
        }
    }
}

#[async_trait]
impl Recorder for SpoolRecorder {
    fn start(&mut self, files: mpsc::UnboundedSender<RecordedFile>) {
        let (program, args) = self.command.render(&source_vars(&self.source));
        let task = run_recorder(
            self.source.clone(),
            program,
            args,
            self.settle,
            self.poll,
            self.retry,
            files,
            self.shutdown_tx.subscribe(),
        );
        self.task = Some(tokio::spawn(task));
    }

    fn active(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_recorder(
    source: SourceConfig,
    program: String,
    args: Vec<String>,
    settle: Duration,
    poll: Duration,
    retry: Duration,
    files: mpsc::UnboundedSender<RecordedFile>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut child = match Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => Some(child),
        Err(e) => {
            warn!(
                source_id = %source.id,
                program = %program,
                error = %e,
                "segmenter failed to start; spool watch continues"
            );
            None
        }
    };

    let mut offered: HashMap<String, Instant> = HashMap::new();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll) => {
                scan_spool(&source, settle, retry, &mut offered, &files).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    if let Some(mut child) = child.take() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    debug!(source_id = %source.id, "recorder unwound");
}

async fn scan_spool(
    source: &SourceConfig,
    settle: Duration,
    retry: Duration,
    offered: &mut HashMap<String, Instant>,
    files: &mpsc::UnboundedSender<RecordedFile>,
) {
    let mut entries = match tokio::fs::read_dir(&source.spool_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(source_id = %source.id, error = %e, "spool directory unreadable");
            return;
        }
    };

    let mut present = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        present.push(name.clone());

        let settled = entry
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.elapsed().ok())
            .map(|age| age >= settle)
            .unwrap_or(false);
        if !settled {
            continue;
        }

        if let Some(last_offer) = offered.get(&name) {
            if last_offer.elapsed() < retry {
                continue;
            }
        }

        offered.insert(name.clone(), Instant::now());
        let _ = files.send(RecordedFile {
            source_id: source.id.clone(),
            dir: source.spool_dir.clone(),
            name,
        });
    }

    // Uploaded files get removed from disk; forget them.
    offered.retain(|name, _| present.iter().any(|p| p == name));
}

// ---------------------------------------------------------------------------
// Process streamer
// ---------------------------------------------------------------------------

/// Runs one publisher process per requested destination.
pub struct ProcessStreamer {
    source: SourceConfig,
    command: CommandTemplate,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ProcessStreamer {
    pub fn new(source: SourceConfig, command: CommandTemplate) -> Self {
        Self {
            source,
            command,
            stop_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl Streamer for ProcessStreamer {
    fn stream(&mut self, destination: StreamDst, status: mpsc::UnboundedSender<StreamEvent>) {
        if self.active() {
            debug!(source_id = %self.source.id, "stream request for active source, re-acknowledged");
            let _ = status.send(StreamEvent {
                source_id: self.source.id.clone(),
                success: true,
            });
            return;
        }

        let mut vars = source_vars(&self.source);
        vars.push(("dst", destination.clone()));
        let (program, args) = self.command.render(&vars);

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);
        self.task = Some(tokio::spawn(run_publisher(
            self.source.id.clone(),
            destination,
            program,
            args,
            status,
            stop_rx,
        )));
    }

    fn stop_stream(&mut self) {
        if let Some(stop_tx) = &self.stop_tx {
            let _ = stop_tx.send(true);
        }
    }

    fn active(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    async fn shutdown(&mut self) {
        self.stop_stream();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_publisher(
    source_id: SourceId,
    destination: StreamDst,
    program: String,
    args: Vec<String>,
    status: mpsc::UnboundedSender<StreamEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut child = match Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(source_id = %source_id, program = %program, error = %e, "publisher failed to start");
            let _ = status.send(StreamEvent {
                source_id,
                success: false,
            });
            return;
        }
    };

    info!(source_id = %source_id, destination = %destination, "publishing");
    let _ = status.send(StreamEvent {
        source_id: source_id.clone(),
        success: true,
    });

    tokio::select! {
        exit = child.wait() => {
            warn!(source_id = %source_id, exit = ?exit, "publisher ended");
            let _ = status.send(StreamEvent {
                source_id,
                success: false,
            });
        }
        _ = stop_rx.changed() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!(source_id = %source_id, "publisher stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitutes_every_placeholder() {
        let template = CommandTemplate {
            program: "pipeline".to_owned(),
            args: vec!["-i".to_owned(), "{uri}".to_owned(), "{dst}".to_owned()],
        };
        let (program, args) = template.render(&[
            ("uri", "rtsp://cam/1".to_owned()),
            ("dst", "rtsps://sink/1".to_owned()),
        ]);
        assert_eq!(program, "pipeline");
        assert_eq!(args, ["-i", "rtsp://cam/1", "rtsps://sink/1"]);
    }
}
