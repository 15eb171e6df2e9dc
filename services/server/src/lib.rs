// server: Control-plane server for a fleet of camera device boxes.
//
// Accepts mutually-authenticated TLS connections from devices, delivers
// each device its configuration, records which sources should be streaming
// (surviving device reconnects), and bridges viewer events from the media
// restreamer into stream requests on the owning device.

pub mod control;
pub mod daemon;
pub mod registry;
pub mod restream;
pub mod session;
pub mod tls;

pub use control::{ControlHandle, ControlServer, ServerTuning};
pub use registry::{SessionContext, SessionRegistry};
pub use restream::{RestreamBridge, RestreamEvent};
