// cl-config: Read-only configuration queries for the control plane.
//
// The server consults one [`ConfigQuery`] implementation for everything it
// knows about the fleet: devices and their pinned certificates, per-device
// video sources, playback users, and its own endpoint and TLS material.
// Two backends exist: [`MemoryConfig`] (programmatic, used by tests and
// embedded setups) and the TOML file loader in [`file`].

pub mod file;
pub mod hash;
pub mod memory;
mod types;

pub use hash::HashType;
pub use memory::MemoryConfig;
pub use types::{CertificateSource, Device, PlaySource, ServerSettings, Source, User};

pub use cl_protocol::{DeviceId, SourceId, StreamDst, UserName};

/// Default control-channel port, shared between server and device builds.
pub const DEFAULT_CONTROL_PORT: u16 = 8100;
/// Default restream (RTSP) port.
pub const DEFAULT_RESTREAM_PORT: u16 = 8554;
/// Default static-content port.
pub const DEFAULT_STATIC_PORT: u16 = 8000;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Read-only lookups against the fleet configuration.
///
/// Implementations are immutable after construction and shared freely across
/// tasks.  `certificate_pem` may hit the filesystem so the server can pick up
/// a rotated certificate on its periodic refresh.
pub trait ConfigQuery: Send + Sync {
    fn server_settings(&self) -> ServerSettings;

    /// Server TLS material: private key plus full certificate chain in one
    /// PEM bundle.
    fn certificate_pem(&self) -> Result<String, ConfigError>;

    fn find_device(&self, id: &DeviceId) -> Option<Device>;

    /// Sources of one device, in configuration order.
    fn device_sources(&self, id: &DeviceId) -> Vec<Source>;

    fn find_device_source(&self, id: &DeviceId, source: &SourceId) -> Option<Source>;

    /// Certificate PEMs of every known device; the control server trusts
    /// exactly this union.
    fn device_certificates(&self) -> Vec<String>;

    fn find_user(&self, name: &UserName) -> Option<User>;

    fn find_user_source(&self, name: &UserName, source: &SourceId) -> Option<PlaySource>;
}
