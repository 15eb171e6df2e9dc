//! In-memory configuration backend.
//!
//! Populated programmatically (`add_device`, `add_device_source`, `add_user`,
//! `add_user_source`) and then used read-only behind [`ConfigQuery`].  The
//! TOML loader in [`crate::file`] builds one of these from disk.

use crate::types::{CertificateSource, Device, PlaySource, ServerSettings, Source, User};
use crate::{ConfigError, ConfigQuery, DeviceId, SourceId, UserName};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryConfig {
    server: ServerSettings,
    certificate: Option<CertificateSource>,
    devices: HashMap<DeviceId, Device>,
    /// Per-device sources in configuration order.
    sources: HashMap<DeviceId, Vec<Source>>,
    users: HashMap<UserName, User>,
    play_sources: HashMap<UserName, Vec<PlaySource>>,
}

impl MemoryConfig {
    pub fn new(server: ServerSettings) -> Self {
        Self {
            server,
            ..Self::default()
        }
    }

    pub fn set_certificate(&mut self, source: CertificateSource) {
        self.certificate = Some(source);
    }

    pub fn add_device(&mut self, device: Device) {
        self.sources.entry(device.id.clone()).or_default();
        self.devices.insert(device.id.clone(), device);
    }

    /// Append a source to a device.  The device must already exist.
    pub fn add_device_source(&mut self, device_id: &DeviceId, source: Source) {
        let Some(sources) = self.sources.get_mut(device_id) else {
            tracing::warn!(device_id = %device_id, "source added for unknown device, skipped");
            return;
        };
        if sources.iter().any(|s| s.id == source.id) {
            tracing::warn!(
                device_id = %device_id,
                source_id = %source.id,
                "duplicate source id, skipped"
            );
            return;
        }
        sources.push(source);
    }

    pub fn add_user(&mut self, user: User) {
        self.play_sources.entry(user.name.clone()).or_default();
        self.users.insert(user.name.clone(), user);
    }

    /// Grant a user playback of one (device, source) pair.
    pub fn add_user_source(&mut self, name: &UserName, play: PlaySource) {
        let Some(sources) = self.play_sources.get_mut(name) else {
            tracing::warn!(user = %name, "play source added for unknown user, skipped");
            return;
        };
        if !sources.iter().any(|p| p.source_id == play.source_id) {
            sources.push(play);
        }
    }
}

impl ConfigQuery for MemoryConfig {
    fn server_settings(&self) -> ServerSettings {
        self.server.clone()
    }

    fn certificate_pem(&self) -> Result<String, ConfigError> {
        match &self.certificate {
            Some(CertificateSource::Inline(pem)) => Ok(pem.clone()),
            Some(CertificateSource::File(path)) => std::fs::read_to_string(path).map_err(|e| {
                ConfigError::Io(format!(
                    "reading server certificate '{}': {}",
                    path.display(),
                    e
                ))
            }),
            None => Err(ConfigError::MissingField("server certificate".to_owned())),
        }
    }

    fn find_device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).cloned()
    }

    fn device_sources(&self, id: &DeviceId) -> Vec<Source> {
        self.sources.get(id).cloned().unwrap_or_default()
    }

    fn find_device_source(&self, id: &DeviceId, source: &SourceId) -> Option<Source> {
        self.sources
            .get(id)?
            .iter()
            .find(|s| &s.id == source)
            .cloned()
    }

    fn device_certificates(&self) -> Vec<String> {
        self.devices
            .values()
            .map(|d| d.certificate_pem.clone())
            .collect()
    }

    fn find_user(&self, name: &UserName) -> Option<User> {
        self.users.get(name).cloned()
    }

    fn find_user_source(&self, name: &UserName, source: &SourceId) -> Option<PlaySource> {
        self.play_sources
            .get(name)?
            .iter()
            .find(|p| &p.source_id == source)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashType;

    fn device(id: &str) -> Device {
        Device {
            id: id.to_owned(),
            certificate_pem: format!("-----BEGIN CERTIFICATE-----\n{id}\n-----END CERTIFICATE-----\n"),
            cloud_token: format!("token-{id}"),
        }
    }

    fn source(id: &str, cap: u64) -> Source {
        Source {
            id: id.to_owned(),
            uri: format!("rtsp://cam/{id}"),
            cloud_max_storage: cap,
        }
    }

    #[test]
    fn device_sources_keep_configuration_order() {
        let mut config = MemoryConfig::new(ServerSettings::default());
        config.add_device(device("d1"));
        config.add_device_source(&"d1".to_owned(), source("zulu", 10));
        config.add_device_source(&"d1".to_owned(), source("alpha", 0));

        let ids: Vec<_> = config
            .device_sources(&"d1".to_owned())
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, ["zulu", "alpha"]);
    }

    #[test]
    fn user_source_lookup() {
        let mut config = MemoryConfig::new(ServerSettings::default());
        config.add_user(User {
            name: "alice".to_owned(),
            hash_type: HashType::Sha256,
            password_salt: "s".to_owned(),
            password_hash: "h".to_owned(),
        });
        config.add_user_source(
            &"alice".to_owned(),
            PlaySource {
                device_id: "d1".to_owned(),
                source_id: "s1".to_owned(),
            },
        );

        let play = config
            .find_user_source(&"alice".to_owned(), &"s1".to_owned())
            .expect("play source");
        assert_eq!(play.device_id, "d1");
        assert!(config
            .find_user_source(&"alice".to_owned(), &"s2".to_owned())
            .is_none());
        assert!(config
            .find_user_source(&"bob".to_owned(), &"s1".to_owned())
            .is_none());
    }

    #[test]
    fn trust_union_covers_all_devices() {
        let mut config = MemoryConfig::new(ServerSettings::default());
        config.add_device(device("d1"));
        config.add_device(device("d2"));
        assert_eq!(config.device_certificates().len(), 2);
    }
}
