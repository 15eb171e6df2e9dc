//! Cloud-storage subsystem: the bounded-concurrency request client and the
//! per-source mirrored folder.

pub mod client;
pub mod folder;

pub use client::{CloudClient, CloudEndpoints, CloudError, CloudHandle, MAX_UPLOADS};
pub use folder::{CloudFolder, FolderState};
