//! Update session - high-level orchestrator for device firmware updates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::engine::{TransferEngine, UpdateError};
use crate::events::{OtaObserver, TracingObserver};
use crate::fetch::ImageFetcher;
use crate::meta::{DeviceInfo, ImageInfo, ImageProvider, UpdateCheck};
use crate::transport::OtaTransport;

/// Configuration for an update session.
///
/// Every timing knob the engine uses lives here; there is no global
/// mutable state. Unset fields fall back to their defaults when loading
/// from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory firmware files with relative URLs are read from.
    pub data_dir: Option<PathBuf>,
    /// How long to wait for the device to answer an image notification.
    pub query_timeout_secs: u64,
    /// How long to wait between block or page requests before declaring
    /// the transfer stalled. Manufacturer quirks may extend this.
    pub block_request_timeout_secs: u64,
    /// How long to wait for the post-reboot network announcement.
    pub announce_timeout_secs: u64,
    /// Minimum spacing between consecutive block responses.
    pub image_block_response_delay_ms: u64,
    /// Payload cap applied to block requests from devices without a
    /// manufacturer-specific override.
    pub default_maximum_data_size: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            query_timeout_secs: 60,
            block_request_timeout_secs: 150,
            announce_timeout_secs: 120,
            image_block_response_delay_ms: 250,
            default_maximum_data_size: 50,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Update session - binds one device, one transport and one image
/// provider together for the lifetime of the update.
pub struct UpdateSession<T: OtaTransport, O: OtaObserver = TracingObserver> {
    config: SessionConfig,
    device: DeviceInfo,
    transport: T,
    provider: Box<dyn ImageProvider>,
    observer: Arc<O>,
}

impl<T: OtaTransport> UpdateSession<T, TracingObserver> {
    /// Create a new session with the default tracing observer.
    pub fn new(
        config: SessionConfig,
        device: DeviceInfo,
        transport: T,
        provider: Box<dyn ImageProvider>,
    ) -> Self {
        Self::with_observer(config, device, transport, provider, Arc::new(TracingObserver))
    }
}

impl<T: OtaTransport, O: OtaObserver + 'static> UpdateSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        config: SessionConfig,
        device: DeviceInfo,
        transport: T,
        provider: Box<dyn ImageProvider>,
        observer: Arc<O>,
    ) -> Self {
        Self {
            config,
            device,
            transport,
            provider,
            observer,
        }
    }

    /// Check whether a newer image exists for the device. Passing a live
    /// identity skips the image-notification round trip.
    pub fn is_update_available(
        &self,
        current: Option<ImageInfo>,
    ) -> Result<UpdateCheck, UpdateError> {
        let mut engine = TransferEngine::new(
            &self.config,
            &self.device,
            &self.transport,
            self.observer.as_ref(),
        );
        engine.is_update_available(self.provider.as_ref(), current)
    }

    /// Run one complete update attempt against the device.
    ///
    /// Returns the new file version after a confirmed upgrade, or `None`
    /// when no applicable image exists.
    pub fn update_to_latest(&self) -> Result<Option<u32>, UpdateError> {
        let fetcher = ImageFetcher::new(self.provider.as_ref(), self.config.data_dir.clone());
        let mut engine = TransferEngine::new(
            &self.config,
            &self.device,
            &self.transport,
            self.observer.as_ref(),
        );
        engine.update_to_latest(&fetcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ImageMeta, ProviderError};
    use crate::transport::MockTransport;

    struct EmptyIndex;

    impl ImageProvider for EmptyIndex {
        fn image_meta(
            &self,
            _current: &ImageInfo,
            _device: &DeviceInfo,
        ) -> Result<Option<ImageMeta>, ProviderError> {
            Ok(None)
        }
    }

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = SessionConfig::default();
        assert_eq!(config.query_timeout_secs, 60);
        assert_eq!(config.block_request_timeout_secs, 150);
        assert_eq!(config.announce_timeout_secs, 120);
        assert_eq!(config.image_block_response_delay_ms, 250);
        assert_eq!(config.default_maximum_data_size, 50);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = SessionConfig {
            data_dir: Some(PathBuf::from("/var/lib/zota")),
            image_block_response_delay_ms: 100,
            ..Default::default()
        };

        let path = std::env::temp_dir().join("zota-session-config-test.toml");
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.image_block_response_delay_ms, 100);
        assert_eq!(loaded.query_timeout_secs, 60);
    }

    #[test]
    fn partial_config_files_fall_back_to_defaults() {
        let config: SessionConfig = toml::from_str("query_timeout_secs = 5").unwrap();
        assert_eq!(config.query_timeout_secs, 5);
        assert_eq!(config.block_request_timeout_secs, 150);
    }

    #[test]
    fn session_reports_no_update_for_empty_index() {
        let session = UpdateSession::new(
            SessionConfig::default(),
            DeviceInfo {
                model_id: "bulb".into(),
                ..Default::default()
            },
            MockTransport::new(),
            Box::new(EmptyIndex),
        );

        let check = session
            .is_update_available(Some(ImageInfo {
                manufacturer_code: 4476,
                image_type: 1,
                file_version: 1,
                hardware_version: None,
            }))
            .unwrap();
        assert!(!check.available);
    }
}
