//! Image metadata resolution and availability ordering.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Image index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Image fetch failed: {0}")]
    FetchFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device-reported identity, supplied by the transport layer from a live
/// query-next-image request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub hardware_version: Option<u16>,
}

/// Static description of the device an update session is attached to.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub ieee_addr: String,
    pub model_id: String,
    pub manufacturer_name: Option<String>,
    pub hardware_version: Option<u16>,
}

/// Resolved remote image descriptor, produced by an [`ImageProvider`].
/// Never mutated after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageMeta {
    pub file_version: u32,
    pub file_size: Option<u32>,
    /// Remote URL or a file name relative to the configured data directory.
    pub url: String,
    /// Serve this image regardless of version ordering (mandatory reflash).
    pub force: bool,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    pub hardware_version_min: Option<u16>,
    pub hardware_version_max: Option<u16>,
    /// Only offered to devices running at least this file version.
    pub min_file_version: Option<u32>,
    /// Only offered to devices running at most this file version.
    pub max_file_version: Option<u32>,
}

/// Vendor image source. Implemented once per vendor index service; the
/// core never depends on vendor identity beyond this interface.
pub trait ImageProvider: Send + Sync {
    /// Latest known image metadata for the given device identity.
    ///
    /// `Ok(None)` means "no data for this device", a normal and frequent
    /// outcome since device catalogs are inherently incomplete.
    fn image_meta(
        &self,
        current: &ImageInfo,
        device: &DeviceInfo,
    ) -> Result<Option<ImageMeta>, ProviderError>;

    /// Vendor-specific byte source. The default returns `Ok(None)`, which
    /// makes the fetcher fall back to its local-file source.
    fn fetch_bytes(&self, _meta: &ImageMeta) -> Result<Option<Vec<u8>>, ProviderError> {
        Ok(None)
    }
}

/// Result of an availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCheck {
    pub available: bool,
    pub current_file_version: u32,
    pub ota_file_version: u32,
}

/// Compare the device's installed version against resolved metadata.
///
/// A `force` flag always reports available. A device running *ahead* of
/// the latest known image is a diagnostic warning, not an update. Missing
/// metadata is "no update", not an error.
pub fn check_availability(
    current: &ImageInfo,
    device: &DeviceInfo,
    meta: Option<&ImageMeta>,
) -> UpdateCheck {
    let Some(meta) = meta else {
        debug!(
            model_id = %device.model_id,
            hardware_version = ?device.hardware_version,
            "no image metadata currently available"
        );

        return UpdateCheck {
            available: false,
            current_file_version: current.file_version,
            ota_file_version: current.file_version,
        };
    };

    if !meta.force && current.file_version > meta.file_version {
        warn!(
            model_id = %device.model_id,
            current = current.file_version,
            latest = meta.file_version,
            "installed firmware is newer than latest available image"
        );
    }

    UpdateCheck {
        available: meta.force || meta.file_version > current.file_version,
        current_file_version: current.file_version,
        ota_file_version: meta.file_version,
    }
}
