//! Upgrade cluster command protocol definitions.
//!
//! Models the device-initiated pull protocol: the device issues requests
//! (query next image, block/page, upgrade end) and the engine answers with
//! the matching responses.

use std::fmt;

use crate::meta::ImageInfo;

/// Command identifier of the upgrade-end request, echoed in default
/// responses acknowledging a rejected upgrade.
pub const UPGRADE_END_REQUEST_COMMAND_ID: u8 = 0x06;

/// Manufacturer codes with documented OTA quirks.
pub mod manufacturer {
    /// OTA only works for data sizes of 40 bytes and smaller.
    pub const INSTA: u16 = 4474;
    /// Newer firmware requires blocks of up to 64 bytes and stalls for a
    /// long time near the end of a transfer.
    pub const LEGRAND: u16 = 4129;
    /// Sonoff devices stall mid-update far beyond the default window.
    pub const COOLKIT: u16 = 4742;
    /// Transfers firmware in the background, over days if need be.
    pub const BOSCH: u16 = 4617;
}

/// Status codes carried by upgrade protocol payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    NotAuthorized,
    MalformedCommand,
    UnsupportedCommand,
    Abort,
    InvalidImage,
    WaitForData,
    NoImageAvailable,
    RequireMoreImage,
    Unknown(u8),
}

impl Status {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Status::Success,
            0x7e => Status::NotAuthorized,
            0x80 => Status::MalformedCommand,
            0x81 => Status::UnsupportedCommand,
            0x95 => Status::Abort,
            0x96 => Status::InvalidImage,
            0x97 => Status::WaitForData,
            0x98 => Status::NoImageAvailable,
            0x99 => Status::RequireMoreImage,
            other => Status::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::NotAuthorized => 0x7e,
            Status::MalformedCommand => 0x80,
            Status::UnsupportedCommand => 0x81,
            Status::Abort => 0x95,
            Status::InvalidImage => 0x96,
            Status::WaitForData => 0x97,
            Status::NoImageAvailable => 0x98,
            Status::RequireMoreImage => 0x99,
            Status::Unknown(other) => *other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::NotAuthorized => write!(f, "not authorized"),
            Status::MalformedCommand => write!(f, "malformed command"),
            Status::UnsupportedCommand => write!(f, "unsupported cluster command"),
            Status::Abort => write!(f, "aborted by device"),
            Status::InvalidImage => write!(f, "invalid image"),
            Status::WaitForData => write!(f, "wait for data"),
            Status::NoImageAvailable => write!(f, "no image available"),
            Status::RequireMoreImage => write!(f, "require more image"),
            Status::Unknown(code) => write!(f, "unknown status 0x{code:02X}"),
        }
    }
}

/// Single-block retrieval request: a bounded byte range of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_offset: u32,
    pub maximum_data_size: u8,
}

/// Burst request covering multiple consecutive blocks within one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub block: BlockRequest,
    pub page_size: u16,
    pub response_spacing: u16,
}

/// Transfer finalization request carrying the device's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEndRequest {
    pub status: Status,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
}

/// Device-initiated commands the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryNextImageRequest(ImageInfo),
    ImageBlockRequest(BlockRequest),
    ImagePageRequest(PageRequest),
    UpgradeEndRequest(UpgradeEndRequest),
    /// Network re-announcement after the device rebooted into new firmware.
    DeviceAnnounce,
}

/// A received command with its transaction sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub transaction_seq: u8,
    pub command: Command,
}

/// Answer to a query-next-image request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNextImageResponse {
    Available {
        manufacturer_code: u16,
        image_type: u16,
        file_version: u32,
        image_size: u32,
    },
    NoImageAvailable,
}

/// One served byte range of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResponse {
    pub status: Status,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_offset: u32,
    pub data: Vec<u8>,
}

/// Engine-initiated commands and responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Notifies the device that a firmware check is warranted.
    ImageNotify { payload_type: u8, query_jitter: u8 },
    QueryNextImageResponse(QueryNextImageResponse),
    ImageBlockResponse(BlockResponse),
    /// Finalizes a successful transfer with a zero-delay activation time.
    UpgradeEndResponse {
        manufacturer_code: u16,
        image_type: u16,
        file_version: u32,
        current_time: u32,
        upgrade_time: u32,
    },
    /// Protocol-level acknowledgement for commands that get no dedicated
    /// response (e.g. a rejected upgrade-end request).
    DefaultResponse { command: u8, status: Status },
}
