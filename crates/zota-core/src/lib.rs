//! zota-core: Zigbee-style OTA firmware update engine.
//!
//! This crate implements the server side of a device-initiated ("pull")
//! firmware upgrade protocol for networked embedded devices on an
//! unreliable, bandwidth-constrained wireless link.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Codec**: upgrade-file container parsing and Silabs EBL/GBL validation
//! - **Meta**: image metadata resolution and availability ordering
//! - **Fetch**: image acquisition, checksum and identity verification
//! - **Protocol**: command/response payloads and status codes
//! - **Transport**: device command link abstraction (mock for testing)
//! - **Engine**: the transfer state machine (block pagination, throttling)
//! - **Events**: observer pattern for UI decoupling
//! - **Session**: high-level orchestrator and configuration
//!
//! # Example
//!
//! ```no_run
//! use zota_core::meta::{DeviceInfo, ImageInfo, ImageMeta, ImageProvider, ProviderError};
//! use zota_core::session::{SessionConfig, UpdateSession};
//! use zota_core::transport::MockTransport;
//!
//! struct Index;
//!
//! impl ImageProvider for Index {
//!     fn image_meta(&self, _: &ImageInfo, _: &DeviceInfo) -> Result<Option<ImageMeta>, ProviderError> {
//!         Ok(None)
//!     }
//! }
//!
//! let config = SessionConfig::default();
//! let device = DeviceInfo {
//!     model_id: "TRADFRI bulb".into(),
//!     ..Default::default()
//! };
//! let session = UpdateSession::new(config, device, MockTransport::new(), Box::new(Index));
//! let new_version = session.update_to_latest().expect("update failed");
//! ```

pub mod codec;
pub mod engine;
pub mod events;
pub mod fetch;
pub mod meta;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use codec::{CodecError, Image, ImageElement, ImageHeader, UPGRADE_FILE_IDENTIFIER};
pub use engine::{TransferEngine, TransferState, UpdateError};
pub use events::{NullObserver, OtaEvent, OtaObserver, TracingObserver};
pub use fetch::{FetchError, ImageFetcher};
pub use meta::{DeviceInfo, ImageInfo, ImageMeta, ImageProvider, ProviderError, UpdateCheck};
pub use protocol::{Command, Incoming, Response, Status};
pub use session::{SessionConfig, UpdateSession};
pub use transport::{MockTransport, OtaTransport, TransportError};
