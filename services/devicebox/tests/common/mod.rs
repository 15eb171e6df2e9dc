//! Shared test doubles for the media handler traits.
//!
//! Every lifecycle call appends to a shared log so tests can assert
//! ordering; streamers report success (or scripted failure) immediately.
#![allow(dead_code)] // not every test binary uses every helper

use async_trait::async_trait;
use devicebox::config::SourceConfig;
use devicebox::media::{MediaFactory, RecordedFile, Recorder, StreamEvent, Streamer};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
pub struct MockMediaFactory {
    pub log: EventLog,
    /// Sources whose streamer reports failure instead of success.
    pub failing: HashSet<String>,
    /// The most recent recorder file channel, for injecting segments.
    pub files: Arc<Mutex<Option<mpsc::UnboundedSender<RecordedFile>>>>,
}

impl MockMediaFactory {
    pub fn failing(sources: &[&str]) -> Self {
        Self {
            failing: sources.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    /// Offer a finished segment as the recorder would.
    pub fn offer_file(&self, file: RecordedFile) {
        if let Some(files) = self.files.lock().expect("files lock").as_ref() {
            let _ = files.send(file);
        }
    }
}

impl MediaFactory for MockMediaFactory {
    fn recorder(&self, source: &SourceConfig) -> Box<dyn Recorder> {
        Box::new(MockRecorder {
            source_id: source.id.clone(),
            log: Arc::clone(&self.log),
            files: Arc::clone(&self.files),
            running: false,
        })
    }

    fn streamer(&self, source: &SourceConfig) -> Box<dyn Streamer> {
        Box::new(MockStreamer {
            source_id: source.id.clone(),
            log: Arc::clone(&self.log),
            fail: self.failing.contains(&source.id),
            streaming: false,
        })
    }
}

pub struct MockRecorder {
    source_id: String,
    log: EventLog,
    files: Arc<Mutex<Option<mpsc::UnboundedSender<RecordedFile>>>>,
    running: bool,
}

#[async_trait]
impl Recorder for MockRecorder {
    fn start(&mut self, files: mpsc::UnboundedSender<RecordedFile>) {
        self.running = true;
        *self.files.lock().expect("files lock") = Some(files);
        self.log
            .lock()
            .expect("log lock")
            .push(format!("recorder-start {}", self.source_id));
    }

    fn active(&self) -> bool {
        self.running
    }

    async fn shutdown(&mut self) {
        self.running = false;
        self.log
            .lock()
            .expect("log lock")
            .push(format!("recorder-shutdown {}", self.source_id));
    }
}

pub struct MockStreamer {
    source_id: String,
    log: EventLog,
    fail: bool,
    streaming: bool,
}

#[async_trait]
impl Streamer for MockStreamer {
    fn stream(&mut self, destination: String, status: mpsc::UnboundedSender<StreamEvent>) {
        if self.streaming {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("streamer-repeat {}", self.source_id));
            let _ = status.send(StreamEvent {
                source_id: self.source_id.clone(),
                success: true,
            });
            return;
        }

        self.log
            .lock()
            .expect("log lock")
            .push(format!("streamer-start {} {}", self.source_id, destination));
        if self.fail {
            let _ = status.send(StreamEvent {
                source_id: self.source_id.clone(),
                success: false,
            });
            return;
        }
        self.streaming = true;
        let _ = status.send(StreamEvent {
            source_id: self.source_id.clone(),
            success: true,
        });
    }

    fn stop_stream(&mut self) {
        self.streaming = false;
        self.log
            .lock()
            .expect("log lock")
            .push(format!("streamer-stop {}", self.source_id));
    }

    fn active(&self) -> bool {
        self.streaming
    }

    async fn shutdown(&mut self) {
        self.streaming = false;
        self.log
            .lock()
            .expect("log lock")
            .push(format!("streamer-shutdown {}", self.source_id));
    }
}
