//! Device-side configuration: TLS identity, per-source derivation from the
//! wire config, and runtime tunables.

use crate::cloud::CloudEndpoints;
use cl_protocol::{SourceId, VideoSource};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TLS identity of this device box.
///
/// `certificate_pem` holds the client certificate and its private key in one
/// PEM bundle; the certificate's subject commonName is the device id the
/// server will see.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub certificate_pem: String,
    /// CA bundle used to verify the server.  Release builds require it;
    /// debug builds fall back to skipping verification, matching the test
    /// certificates in use there.
    pub server_ca_pem: Option<String>,
}

/// Runtime tunables with production defaults.  Tests shrink the timers.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Fixed reconnect backoff.  Deliberately not exponential: the fleet is
    /// small and operator-controlled.
    pub reconnect_interval: Duration,
    /// Cloud folder eviction sweep period.
    pub sweep_interval: Duration,
    /// Cloud folder incremental listing period.
    pub poll_interval: Duration,
    /// How long a spool file must sit unmodified before it counts as a
    /// finished segment.
    pub spool_settle: Duration,
    /// Spool directory scan period.
    pub spool_poll: Duration,
    /// Re-offer a spool file whose upload did not succeed after this long.
    pub upload_retry: Duration,
    /// Root under which per-source spool directories are created.
    pub spool_root: PathBuf,
    pub cloud: CloudEndpoints,
}

impl Default for Tuning {
    fn default() -> Self {
        let reconnect_interval = if cfg!(debug_assertions) {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(60)
        };
        Self {
            reconnect_interval,
            sweep_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            spool_settle: Duration::from_secs(2),
            spool_poll: Duration::from_secs(2),
            upload_retry: Duration::from_secs(60),
            spool_root: std::env::temp_dir(),
            cloud: CloudEndpoints::default(),
        }
    }
}

/// Per-source configuration derived from one wire [`VideoSource`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub id: SourceId,
    pub uri: String,
    pub user: String,
    pub password: String,
    /// Local directory the recorder spools finished segments into.
    pub spool_dir: PathBuf,
    /// Remote folder the source mirrors into, `/<source-id>/`.
    pub cloud_archive_path: String,
    /// Cloud cap in bytes; the wire carries megabytes.
    pub cloud_max_bytes: u64,
}

impl SourceConfig {
    pub fn from_wire(source: &VideoSource, spool_root: &Path) -> std::io::Result<Self> {
        let spool_dir = spool_root.join(format!("camlink-spool-{}", source.id));
        std::fs::create_dir_all(&spool_dir)?;

        Ok(Self {
            id: source.id.clone(),
            uri: source.uri.clone(),
            user: source.user.clone(),
            password: source.password.clone(),
            spool_dir,
            cloud_archive_path: format!("/{}/", source.id),
            cloud_max_bytes: source.cloud_max_storage * 1024 * 1024,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_source_derivation() {
        let wire = VideoSource {
            id: "cam7".to_owned(),
            uri: "rtsp://cam/7".to_owned(),
            user: "u".to_owned(),
            password: "p".to_owned(),
            cloud_max_storage: 3,
        };
        let config =
            SourceConfig::from_wire(&wire, &std::env::temp_dir()).expect("derive source config");

        assert_eq!(config.cloud_archive_path, "/cam7/");
        assert_eq!(config.cloud_max_bytes, 3 * 1024 * 1024);
        assert!(config.spool_dir.is_dir());
    }
}
