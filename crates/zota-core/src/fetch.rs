//! Image acquisition and verification.
//!
//! Turns resolved metadata into a parsed, validated [`Image`] ready for
//! serving. Bytes come either from the provider's own source or from a
//! file relative to the configured data directory, and are verified
//! against the metadata checksum and the device identity before any of
//! them reach the wire.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::codec::{self, Image};
use crate::meta::{self, DeviceInfo, ImageInfo, ImageMeta, ImageProvider, ProviderError};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("No image metadata available for this device")]
    MetadataUnavailable,

    #[error("No new image available (latest {latest}, device runs {current})")]
    NoNewImage { latest: u32, current: u32 },

    #[error("Image checksum mismatch (expected {expected}, computed {computed})")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("Upgrade file identifier not found in downloaded image")]
    IdentifierNotFound,

    #[error("Image does not match device identity: {field}")]
    IdentityMismatch { field: &'static str },

    #[error("Image declares hardware version bounds but the device hardware version is unknown")]
    HardwareVersionUnknown,

    #[error("Image codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Acquires and verifies upgrade images for a device.
pub struct ImageFetcher<'a> {
    provider: &'a dyn ImageProvider,
    data_dir: Option<PathBuf>,
}

impl<'a> ImageFetcher<'a> {
    pub fn new(provider: &'a dyn ImageProvider, data_dir: Option<PathBuf>) -> Self {
        Self { provider, data_dir }
    }

    /// Resolve, download, verify and parse the newest image for a device.
    ///
    /// Fails with [`FetchError::NoNewImage`] when the device already runs
    /// the latest version and the metadata does not force a reflash, and
    /// with [`FetchError::MetadataUnavailable`] when no metadata applies
    /// to this device at all.
    #[instrument(skip(self), fields(model_id = %device.model_id))]
    pub fn get_new_image(
        &self,
        current: &ImageInfo,
        device: &DeviceInfo,
    ) -> Result<Image, FetchError> {
        let meta = self
            .provider
            .image_meta(current, device)?
            .ok_or(FetchError::MetadataUnavailable)?;

        ensure_meta_applies(&meta, current, device)?;

        let check = meta::check_availability(current, device, Some(&meta));
        if !check.available {
            return Err(FetchError::NoNewImage {
                latest: check.ota_file_version,
                current: check.current_file_version,
            });
        }

        info!(
            url = %meta.url,
            file_version = meta.file_version,
            "downloading new firmware image"
        );

        let bytes = self.download(&meta)?;
        verify_checksum(&bytes, &meta)?;

        // Some distributions prepend vendor wrappers before the upgrade
        // file proper, so locate the identifier instead of assuming
        // offset zero.
        let start = codec::find_image_start(&bytes).ok_or(FetchError::IdentifierNotFound)?;
        if start > 0 {
            debug!(offset = start, "upgrade file identifier found behind a prefix");
        }

        let image = codec::parse_image(&bytes[start..])?;
        cross_validate(&image, &meta, current, device)?;
        codec::validate_image(&image)?;

        Ok(image)
    }

    fn download(&self, meta: &ImageMeta) -> Result<Vec<u8>, FetchError> {
        if let Some(bytes) = self.provider.fetch_bytes(meta)? {
            return Ok(bytes);
        }

        if meta.url.starts_with("http://") || meta.url.starts_with("https://") {
            return Err(FetchError::Provider(ProviderError::FetchFailed(format!(
                "provider supplied no byte source for remote url {}",
                meta.url
            ))));
        }

        let path = Path::new(&meta.url);
        let path = match (&self.data_dir, path.is_relative()) {
            (Some(dir), true) => dir.join(path),
            _ => path.to_path_buf(),
        };

        debug!(path = %path.display(), "reading firmware image from local file");
        Ok(fs::read(path)?)
    }
}

/// Apply metadata applicability bounds: installed-version window and
/// hardware version window. An image outside either window is simply
/// not for this device.
fn ensure_meta_applies(
    meta: &ImageMeta,
    current: &ImageInfo,
    device: &DeviceInfo,
) -> Result<(), FetchError> {
    if let Some(min) = meta.min_file_version {
        if current.file_version < min {
            return Err(FetchError::MetadataUnavailable);
        }
    }
    if let Some(max) = meta.max_file_version {
        if current.file_version > max {
            return Err(FetchError::MetadataUnavailable);
        }
    }

    if meta.hardware_version_min.is_some() || meta.hardware_version_max.is_some() {
        let hardware = current
            .hardware_version
            .or(device.hardware_version)
            .ok_or(FetchError::HardwareVersionUnknown)?;

        if meta.hardware_version_min.is_some_and(|min| hardware < min)
            || meta.hardware_version_max.is_some_and(|max| hardware > max)
        {
            return Err(FetchError::MetadataUnavailable);
        }
    }

    Ok(())
}

fn verify_checksum(bytes: &[u8], meta: &ImageMeta) -> Result<(), FetchError> {
    // Prefer the stronger digest when the index carries both.
    let (expected, computed) = if let Some(expected) = &meta.sha512 {
        (expected, hex::encode(Sha512::digest(bytes)))
    } else if let Some(expected) = &meta.sha256 {
        (expected, hex::encode(Sha256::digest(bytes)))
    } else {
        return Ok(());
    };

    if !computed.eq_ignore_ascii_case(expected) {
        return Err(FetchError::ChecksumMismatch {
            expected: expected.clone(),
            computed,
        });
    }

    Ok(())
}

/// Match the parsed header against the metadata that advertised it and
/// the device that is about to receive it.
fn cross_validate(
    image: &Image,
    meta: &ImageMeta,
    current: &ImageInfo,
    device: &DeviceInfo,
) -> Result<(), FetchError> {
    if image.header.file_version != meta.file_version {
        return Err(FetchError::IdentityMismatch {
            field: "file version",
        });
    }

    if let Some(size) = meta.file_size {
        if image.header.total_image_size != size {
            return Err(FetchError::IdentityMismatch { field: "file size" });
        }
    }

    if image.header.manufacturer_code != current.manufacturer_code {
        return Err(FetchError::IdentityMismatch {
            field: "manufacturer code",
        });
    }

    if image.header.image_type != current.image_type {
        return Err(FetchError::IdentityMismatch { field: "image type" });
    }

    if image.header.minimum_hardware_version.is_some()
        || image.header.maximum_hardware_version.is_some()
    {
        let hardware = current
            .hardware_version
            .or(device.hardware_version)
            .ok_or(FetchError::HardwareVersionUnknown)?;

        let below = image
            .header
            .minimum_hardware_version
            .is_some_and(|min| hardware < min);
        let above = image
            .header
            .maximum_hardware_version
            .is_some_and(|max| hardware > max);
        if below || above {
            return Err(FetchError::IdentityMismatch {
                field: "hardware version",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_image_buffer;

    struct StaticProvider {
        meta: Option<ImageMeta>,
        bytes: Option<Vec<u8>>,
    }

    impl ImageProvider for StaticProvider {
        fn image_meta(
            &self,
            _current: &ImageInfo,
            _device: &DeviceInfo,
        ) -> Result<Option<ImageMeta>, ProviderError> {
            Ok(self.meta.clone())
        }

        fn fetch_bytes(&self, _meta: &ImageMeta) -> Result<Option<Vec<u8>>, ProviderError> {
            Ok(self.bytes.clone())
        }
    }

    fn identity() -> ImageInfo {
        ImageInfo {
            manufacturer_code: 4476,
            image_type: 1,
            file_version: 1,
            hardware_version: None,
        }
    }

    fn meta_for(bytes: &[u8], file_version: u32) -> ImageMeta {
        ImageMeta {
            file_version,
            url: "firmware.ota".into(),
            sha256: Some(hex::encode(Sha256::digest(bytes))),
            ..Default::default()
        }
    }

    #[test]
    fn fetches_and_verifies_image() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[0xAA; 64])]);
        let provider = StaticProvider {
            meta: Some(meta_for(&buffer, 2)),
            bytes: Some(buffer.clone()),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        let image = fetcher
            .get_new_image(&identity(), &DeviceInfo::default())
            .unwrap();
        assert_eq!(image.header.file_version, 2);
        assert_eq!(image.raw, buffer);
    }

    #[test]
    fn finds_image_behind_vendor_prefix() {
        let inner = test_image_buffer(4476, 1, 2, &[(0, &[0xAA; 64])]);
        let mut buffer = b"vendor-wrapper".to_vec();
        buffer.extend_from_slice(&inner);

        let provider = StaticProvider {
            meta: Some(meta_for(&buffer, 2)),
            bytes: Some(buffer),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        let image = fetcher
            .get_new_image(&identity(), &DeviceInfo::default())
            .unwrap();
        assert_eq!(image.raw, inner);
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[0xAA; 64])]);
        let mut meta = meta_for(&buffer, 2);
        meta.sha256 = Some("00".repeat(32));

        let provider = StaticProvider {
            meta: Some(meta),
            bytes: Some(buffer),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn metadata_version_must_match_header() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[0xAA; 64])]);
        let mut meta = meta_for(&buffer, 3);
        meta.sha256 = Some(hex::encode(Sha256::digest(&buffer)));

        let provider = StaticProvider {
            meta: Some(meta),
            bytes: Some(buffer),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::IdentityMismatch {
                field: "file version"
            })
        ));
    }

    #[test]
    fn image_for_other_manufacturer_is_rejected() {
        let buffer = test_image_buffer(9999, 1, 2, &[(0, &[0xAA; 64])]);
        let provider = StaticProvider {
            meta: Some(meta_for(&buffer, 2)),
            bytes: Some(buffer),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::IdentityMismatch {
                field: "manufacturer code"
            })
        ));
    }

    #[test]
    fn same_version_without_force_yields_no_new_image() {
        let buffer = test_image_buffer(4476, 1, 1, &[(0, &[0xAA; 64])]);
        let provider = StaticProvider {
            meta: Some(meta_for(&buffer, 1)),
            bytes: Some(buffer),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::NoNewImage {
                latest: 1,
                current: 1
            })
        ));
    }

    #[test]
    fn missing_metadata_is_reported_as_unavailable() {
        let provider = StaticProvider {
            meta: None,
            bytes: None,
        };
        let fetcher = ImageFetcher::new(&provider, None);

        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::MetadataUnavailable)
        ));
    }

    #[test]
    fn installed_version_window_excludes_device() {
        let buffer = test_image_buffer(4476, 1, 5, &[(0, &[0xAA; 64])]);
        let mut meta = meta_for(&buffer, 5);
        meta.min_file_version = Some(3);

        let provider = StaticProvider {
            meta: Some(meta),
            bytes: Some(buffer),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        // Device runs version 1, image requires at least 3 installed.
        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::MetadataUnavailable)
        ));
    }

    #[test]
    fn hardware_bounds_require_a_known_hardware_version() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[0xAA; 64])]);
        let mut meta = meta_for(&buffer, 2);
        meta.hardware_version_min = Some(2);

        let provider = StaticProvider {
            meta: Some(meta),
            bytes: Some(buffer),
        };
        let fetcher = ImageFetcher::new(&provider, None);

        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::HardwareVersionUnknown)
        ));
    }

    #[test]
    fn reads_image_from_data_directory() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[0xAA; 64])]);
        let dir = std::env::temp_dir().join("zota-fetch-local-test");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("firmware.ota"), &buffer).unwrap();

        let provider = StaticProvider {
            meta: Some(meta_for(&buffer, 2)),
            bytes: None,
        };
        let fetcher = ImageFetcher::new(&provider, Some(dir.clone()));

        let image = fetcher
            .get_new_image(&identity(), &DeviceInfo::default())
            .unwrap();
        assert_eq!(image.raw, buffer);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn remote_url_without_byte_source_is_an_error() {
        let meta = ImageMeta {
            file_version: 2,
            url: "https://example.org/fw.ota".into(),
            ..Default::default()
        };

        let provider = StaticProvider {
            meta: Some(meta),
            bytes: None,
        };
        let fetcher = ImageFetcher::new(&provider, None);

        assert!(matches!(
            fetcher.get_new_image(&identity(), &DeviceInfo::default()),
            Err(FetchError::Provider(ProviderError::FetchFailed(_)))
        ));
    }
}
