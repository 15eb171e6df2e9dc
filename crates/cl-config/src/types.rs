//! Configuration record types shared by all backends.

use crate::hash::HashType;
use cl_protocol::{DeviceId, SourceId, UserName};
use std::path::PathBuf;

/// One video source of a device, as the server knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: SourceId,
    pub uri: String,
    /// Cloud mirror cap in megabytes; 0 disables mirroring.
    pub cloud_max_storage: u64,
}

/// One remote camera box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    /// Pinned client certificate, PEM.  The control server trusts this exact
    /// certificate and maps its subject commonName back to the device id.
    pub certificate_pem: String,
    /// Bearer token for the device's cloud-storage account.
    pub cloud_token: String,
}

/// A (device, source) pair a user may play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaySource {
    pub device_id: DeviceId,
    pub source_id: SourceId,
}

/// A playback user.  The anonymous user has an empty name and no password
/// material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: UserName,
    pub hash_type: HashType,
    pub password_salt: String,
    /// Lowercase hex of `H(salt + password)`.
    pub password_hash: String,
}

/// Where the server certificate bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    /// PEM text held in memory.
    Inline(String),
    /// Re-read from disk on every query, so the 24 h refresh observes
    /// rotation.
    File(PathBuf),
}

/// Server endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Public host name devices and restream URLs refer to.
    pub host: String,
    pub control_port: u16,
    pub restream_port: u16,
    pub static_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            control_port: crate::DEFAULT_CONTROL_PORT,
            restream_port: crate::DEFAULT_RESTREAM_PORT,
            static_port: crate::DEFAULT_STATIC_PORT,
        }
    }
}
