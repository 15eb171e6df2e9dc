// devicebox: Device-side agent for a remote camera box.
//
// Maintains the TLS control channel to the central server, owns one handler
// group per configured video source (segment recorder, restream publisher,
// cloud mirror), and keeps the cloud folder of each source under its
// configured size cap.

pub mod client;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod media;

pub use client::{DeviceClient, DeviceClientConfig};
pub use config::{AuthConfig, SourceConfig, Tuning};
pub use controller::{spawn_controller, ControllerEvent, ControllerHandle};
