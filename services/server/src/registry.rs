//! Per-device session state.
//!
//! A [`SessionContext`] is created lazily on first reference and lives for
//! the process: its desired-streams set is the authoritative record of what
//! should be streaming, independent of whether the device is connected.
//! The active-session reference is a command channel into the live session
//! task and is cleared when that session ends.

use cl_protocol::{DeviceId, SourceId, StreamDst};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Commands a live server session accepts from the control server.
#[derive(Debug)]
pub enum SessionCommand {
    RequestStream(SourceId),
    StopStream(SourceId),
}

#[derive(Debug, Default)]
pub struct SessionContext {
    active: Option<mpsc::UnboundedSender<SessionCommand>>,
    /// Sources with an outstanding RequestStream, in request order.
    desired: Vec<(SourceId, StreamDst)>,
}

impl SessionContext {
    pub fn active(&self) -> Option<&mpsc::UnboundedSender<SessionCommand>> {
        self.active.as_ref()
    }

    /// Bind a live session.  Fails when another session is already active,
    /// in which case the newcomer must idle until its peer drops.
    pub fn attach(&mut self, id: &DeviceId, session: mpsc::UnboundedSender<SessionCommand>) -> bool {
        if self.active.is_some() {
            return false;
        }
        info!(device_id = %id, "device connected");
        self.active = Some(session);
        true
    }

    /// Clear the live-session reference; the desired set is untouched.
    pub fn detach(&mut self, id: &DeviceId) {
        self.active = None;
        info!(
            device_id = %id,
            desired = self.desired.len(),
            "device disconnected"
        );
    }

    pub fn stream_requested(&mut self, source_id: SourceId, dst: StreamDst) {
        debug!(source_id = %source_id, dst = %dst, "stream requested");
        match self.desired.iter().find(|(id, _)| id == &source_id) {
            None => self.desired.push((source_id, dst)),
            Some((_, active_dst)) => {
                error!(
                    source_id = %source_id,
                    active_dst = %active_dst,
                    new_dst = %dst,
                    "requested streaming of an already active source"
                );
            }
        }
    }

    pub fn stop_requested(&mut self, source_id: &SourceId) {
        debug!(source_id = %source_id, "stream stop requested");
        self.desired.retain(|(id, _)| id != source_id);
    }

    /// The destination a source should currently stream to, if any.
    pub fn should_stream(&self, source_id: &SourceId) -> Option<StreamDst> {
        self.desired
            .iter()
            .find(|(id, _)| id == source_id)
            .map(|(_, dst)| dst.clone())
    }

    /// The desired set in request order.
    pub fn desired_streams(&self) -> Vec<(SourceId, StreamDst)> {
        self.desired.clone()
    }
}

/// Process-wide map from device id to its context.  Contexts are never
/// removed, so desired streams survive disconnects; memory grows with the
/// number of devices ever told to stream, which is fine at fleet size.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    contexts: HashMap<DeviceId, SessionContext>,
}

impl SessionRegistry {
    /// Look up a context, creating it on first reference.
    pub fn get(&mut self, id: &DeviceId) -> &mut SessionContext {
        self.contexts.entry(id.clone()).or_default()
    }

    /// Non-creating lookup.
    pub fn find(&self, id: &DeviceId) -> Option<&SessionContext> {
        self.contexts.get(id)
    }
}
