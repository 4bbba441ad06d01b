//! Upgrade-file container codec.
//!
//! Parses the OTA upgrade file format (fixed header, optional
//! field-control-gated fields, contiguous tagged sub-elements) and
//! validates embedded Silabs EBL/GBL firmware containers by walking
//! their tag/length records and checking the CRC-32 residue.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::debug;

/// Upgrade file magic identifier, first 4 bytes of every valid header.
pub const UPGRADE_FILE_IDENTIFIER: [u8; 4] = [0x1e, 0xf1, 0xee, 0x0b];

/// Size of the fixed header region, up to and including `total_image_size`.
pub const OTA_HEADER_FIXED_LEN: usize = 56;

/// Sub-element prefix: 2-byte tag plus 4-byte length.
pub const ELEMENT_HEADER_LEN: usize = 6;

/// CRC-32 residue of a valid Silabs container (CRC over payload plus the
/// stored CRC itself).
pub const VALID_SILABS_CRC: u32 = 0x2144_df1c;

const EBL_TAG_HEADER: u16 = 0x0000;
const EBL_TAG_ENC_HEADER: u16 = 0xfb05;
const EBL_TAG_END: u16 = 0xfc04;
const EBL_PADDING: u8 = 0xff;
const EBL_IMAGE_SIGNATURE: u16 = 0xe350;
const GBL_TAG_HEADER: u32 = 0xeb17_a603;
const GBL_TAG_END: u32 = 0xfc04_04fc;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Not a valid OTA file (bad upgrade file identifier)")]
    BadMagic,

    #[error("Size mismatch: element table ends at {position}, total image size is {total}")]
    SizeMismatch { position: usize, total: usize },

    #[error("Truncated element at offset {position}")]
    TruncatedElement { position: usize },

    #[error("Image is truncated, not long enough to contain a valid end tag")]
    TruncatedImage,

    #[error("Image padding contains invalid bytes")]
    InvalidPadding,

    #[error("Image CRC-32 is invalid (computed 0x{computed:08X})")]
    CrcMismatch { computed: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed upgrade file header.
///
/// Conditional fields are gated by `field_control` bits: bit 0 adds the
/// security credential version, bit 1 the upgrade file destination and
/// bit 2 the hardware version bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub header_version: u16,
    pub header_length: u16,
    pub field_control: u16,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub stack_version: u16,
    pub header_string: String,
    pub total_image_size: u32,
    pub security_credential_version: Option<u8>,
    pub upgrade_file_destination: Option<[u8; 8]>,
    pub minimum_hardware_version: Option<u16>,
    pub maximum_hardware_version: Option<u16>,
}

/// A tagged sub-region of the upgrade file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageElement {
    pub tag_id: u16,
    pub length: u32,
    pub data: Vec<u8>,
}

/// Parsed firmware image: header, ordered sub-elements and the raw bytes
/// truncated to `total_image_size`. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub header: ImageHeader,
    pub elements: Vec<ImageElement>,
    pub raw: Vec<u8>,
}

/// Locate the upgrade file identifier inside a downloaded buffer.
///
/// Some distributions prepend vendor container formats, so the magic is
/// not necessarily at offset 0.
pub fn find_image_start(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(UPGRADE_FILE_IDENTIFIER.len())
        .position(|window| window == UPGRADE_FILE_IDENTIFIER)
}

fn subslice(buffer: &[u8], start: usize, len: usize) -> Option<&[u8]> {
    buffer.get(start..start.checked_add(len)?)
}

/// Parse a raw byte buffer into a structured [`Image`].
///
/// The cursor walks the fixed 56-byte header, then the conditional fields
/// in field-control bit order, then the sub-element table from
/// `header_length` which must land exactly on `total_image_size`.
pub fn parse_image(buffer: &[u8]) -> Result<Image, CodecError> {
    if buffer.len() < OTA_HEADER_FIXED_LEN {
        return Err(CodecError::BufferTooSmall {
            expected: OTA_HEADER_FIXED_LEN,
            actual: buffer.len(),
        });
    }

    if buffer[0..4] != UPGRADE_FILE_IDENTIFIER {
        return Err(CodecError::BadMagic);
    }

    let mut cursor = Cursor::new(buffer);
    cursor.set_position(4);

    let header_version = cursor.read_u16::<LittleEndian>()?;
    let header_length = cursor.read_u16::<LittleEndian>()?;
    let field_control = cursor.read_u16::<LittleEndian>()?;
    let manufacturer_code = cursor.read_u16::<LittleEndian>()?;
    let image_type = cursor.read_u16::<LittleEndian>()?;
    let file_version = cursor.read_u32::<LittleEndian>()?;
    let stack_version = cursor.read_u16::<LittleEndian>()?;
    let header_string = String::from_utf8_lossy(&buffer[20..52])
        .trim_end_matches('\0')
        .to_string();
    cursor.set_position(52);
    let total_image_size = cursor.read_u32::<LittleEndian>()?;

    let mut security_credential_version = None;
    let mut upgrade_file_destination = None;
    let mut minimum_hardware_version = None;
    let mut maximum_hardware_version = None;

    if field_control & 1 != 0 {
        security_credential_version = Some(cursor.read_u8()?);
    }

    if field_control & 2 != 0 {
        let mut destination = [0u8; 8];
        cursor.read_exact(&mut destination)?;
        upgrade_file_destination = Some(destination);
    }

    if field_control & 4 != 0 {
        minimum_hardware_version = Some(cursor.read_u16::<LittleEndian>()?);
        maximum_hardware_version = Some(cursor.read_u16::<LittleEndian>()?);
    }

    let header = ImageHeader {
        header_version,
        header_length,
        field_control,
        manufacturer_code,
        image_type,
        file_version,
        stack_version,
        header_string,
        total_image_size,
        security_credential_version,
        upgrade_file_destination,
        minimum_hardware_version,
        maximum_hardware_version,
    };

    let total = header.total_image_size as usize;

    if buffer.len() < total {
        return Err(CodecError::BufferTooSmall {
            expected: total,
            actual: buffer.len(),
        });
    }

    let mut position = header.header_length as usize;
    let mut elements = Vec::new();

    while position < total {
        let prefix = subslice(buffer, position, ELEMENT_HEADER_LEN)
            .ok_or(CodecError::TruncatedElement { position })?;
        let tag_id = u16::from_le_bytes([prefix[0], prefix[1]]);
        let length = u32::from_le_bytes([prefix[2], prefix[3], prefix[4], prefix[5]]);
        let data = subslice(buffer, position + ELEMENT_HEADER_LEN, length as usize)
            .ok_or(CodecError::TruncatedElement { position })?;

        elements.push(ImageElement {
            tag_id,
            length,
            data: data.to_vec(),
        });

        position += ELEMENT_HEADER_LEN + length as usize;
    }

    if position != total {
        return Err(CodecError::SizeMismatch { position, total });
    }

    debug!(
        manufacturer_code = header.manufacturer_code,
        image_type = header.image_type,
        file_version = header.file_version,
        total_image_size = header.total_image_size,
        elements = elements.len(),
        "parsed image"
    );

    Ok(Image {
        header,
        elements,
        raw: buffer[..total].to_vec(),
    })
}

/// Validate the embedded firmware containers of a parsed image.
///
/// Elements whose payload carries neither an EBL nor a GBL signature are
/// skipped; not every sub-element is a firmware container. Running this
/// before a transfer starts avoids wasting a device's flash-erase cycles
/// on a corrupted download.
pub fn validate_image(image: &Image) -> Result<(), CodecError> {
    for element in &image.elements {
        let data = &element.data[..];

        if data.len() >= 4 && data[0..4] == GBL_TAG_HEADER.to_be_bytes() {
            validate_silabs_gbl(data)?;
        } else if data.len() >= 2 {
            let tag = u16::from_be_bytes([data[0], data[1]]);
            let signed_header = tag == EBL_TAG_HEADER
                && data.len() >= 8
                && u16::from_be_bytes([data[6], data[7]]) == EBL_IMAGE_SIGNATURE;

            if signed_header || tag == EBL_TAG_ENC_HEADER {
                validate_silabs_ebl(data)?;
            }
        }
    }

    Ok(())
}

/// EBL container: `{tag:u16 BE, len:u16 BE, payload}` records, walked to
/// the end tag. Everything after the end record must be 0xFF padding and
/// the running CRC-32 through the end record must equal the Silabs residue.
fn validate_silabs_ebl(data: &[u8]) -> Result<(), CodecError> {
    let data_length = data.len();
    let mut position = 0usize;

    while position + 4 <= data_length {
        let tag = u16::from_be_bytes([data[position], data[position + 1]]);
        let len = u16::from_be_bytes([data[position + 2], data[position + 3]]) as usize;

        position += 4 + len;

        if tag != EBL_TAG_END {
            continue;
        }

        if position > data_length {
            return Err(CodecError::TruncatedImage);
        }

        if data[position..].iter().any(|&byte| byte != EBL_PADDING) {
            return Err(CodecError::InvalidPadding);
        }

        let computed = crc32fast::hash(&data[..position]);

        if computed != VALID_SILABS_CRC {
            return Err(CodecError::CrcMismatch { computed });
        }

        return Ok(());
    }

    Err(CodecError::TruncatedImage)
}

/// GBL container: same end-tag plus CRC-32 discipline as EBL, with
/// `{tag:u32 BE, len:u32 LE, payload}` record headers.
fn validate_silabs_gbl(data: &[u8]) -> Result<(), CodecError> {
    let data_length = data.len();
    let mut position = 0usize;

    while position + 8 <= data_length {
        let tag = u32::from_be_bytes([
            data[position],
            data[position + 1],
            data[position + 2],
            data[position + 3],
        ]);
        let len = u32::from_le_bytes([
            data[position + 4],
            data[position + 5],
            data[position + 6],
            data[position + 7],
        ]) as usize;

        position += 8 + len;

        if tag != GBL_TAG_END {
            continue;
        }

        if position > data_length {
            return Err(CodecError::TruncatedImage);
        }

        let computed = crc32fast::hash(&data[..position]);

        if computed != VALID_SILABS_CRC {
            return Err(CodecError::CrcMismatch { computed });
        }

        return Ok(());
    }

    Err(CodecError::TruncatedImage)
}

/// Build a minimal upgrade file buffer for use in tests across the crate.
#[cfg(test)]
pub(crate) fn test_image_buffer(
    manufacturer_code: u16,
    image_type: u16,
    file_version: u32,
    elements: &[(u16, &[u8])],
) -> Vec<u8> {
    let elements_len: usize = elements
        .iter()
        .map(|(_, data)| ELEMENT_HEADER_LEN + data.len())
        .sum();
    let total = OTA_HEADER_FIXED_LEN + elements_len;

    let mut buffer = Vec::with_capacity(total);
    buffer.extend_from_slice(&UPGRADE_FILE_IDENTIFIER);
    buffer.extend_from_slice(&0x0100u16.to_le_bytes()); // header version
    buffer.extend_from_slice(&(OTA_HEADER_FIXED_LEN as u16).to_le_bytes());
    buffer.extend_from_slice(&0u16.to_le_bytes()); // field control
    buffer.extend_from_slice(&manufacturer_code.to_le_bytes());
    buffer.extend_from_slice(&image_type.to_le_bytes());
    buffer.extend_from_slice(&file_version.to_le_bytes());
    buffer.extend_from_slice(&2u16.to_le_bytes()); // stack version

    let mut header_string = [0u8; 32];
    header_string[..9].copy_from_slice(b"test-file");
    buffer.extend_from_slice(&header_string);
    buffer.extend_from_slice(&(total as u32).to_le_bytes());

    for (tag, data) in elements {
        buffer.extend_from_slice(&tag.to_le_bytes());
        buffer.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buffer.extend_from_slice(data);
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an EBL container whose CRC lands on the Silabs residue: the
    /// end record's 4-byte payload is the CRC-32 of everything before it.
    fn valid_ebl(padding: usize) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&EBL_TAG_HEADER.to_be_bytes());
        data.extend_from_slice(&4u16.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        data.extend_from_slice(&EBL_IMAGE_SIGNATURE.to_be_bytes());
        data.extend_from_slice(&EBL_TAG_END.to_be_bytes());
        data.extend_from_slice(&4u16.to_be_bytes());
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data.extend(std::iter::repeat(EBL_PADDING).take(padding));
        data
    }

    fn valid_gbl() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&GBL_TAG_HEADER.to_be_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&[0x03, 0x01, 0x00, 0x00]);
        data.extend_from_slice(&GBL_TAG_END.to_be_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    #[test]
    fn parses_single_element_image() {
        // 56-byte header plus one element: 6-byte prefix and 194 bytes of
        // payload, totalImageSize = 256.
        let payload = vec![0xabu8; 194];
        let buffer = test_image_buffer(4476, 1, 0x2003_0405, &[(0x0000, &payload)]);
        assert_eq!(buffer.len(), 256);

        let image = parse_image(&buffer).unwrap();
        assert_eq!(image.header.total_image_size, 256);
        assert_eq!(image.header.manufacturer_code, 4476);
        assert_eq!(image.header.file_version, 0x2003_0405);
        assert_eq!(image.header.header_string, "test-file");
        assert_eq!(image.elements.len(), 1);
        assert_eq!(image.elements[0].length, 194);
        assert_eq!(image.elements[0].data, payload);
        assert_eq!(image.raw, buffer);
    }

    #[test]
    fn element_sizes_sum_to_total_image_size() {
        let buffer = test_image_buffer(
            4476,
            1,
            2,
            &[(0x0000, &[1u8; 40][..]), (0x00f0, &[2u8; 7][..]), (0x00f1, &[][..])],
        );
        let image = parse_image(&buffer).unwrap();

        let elements_total: usize = image
            .elements
            .iter()
            .map(|element| ELEMENT_HEADER_LEN + element.data.len())
            .sum();
        assert_eq!(
            image.header.header_length as usize + elements_total,
            image.header.total_image_size as usize
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buffer = test_image_buffer(4476, 1, 2, &[(0, &[0u8; 10][..])]);
        buffer[0] = 0xde;
        assert!(matches!(parse_image(&buffer), Err(CodecError::BadMagic)));
    }

    #[test]
    fn rejects_truncated_image() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[0u8; 64][..])]);
        let result = parse_image(&buffer[..buffer.len() - 1]);
        assert!(matches!(result, Err(CodecError::BufferTooSmall { .. })));
    }

    #[test]
    fn rejects_element_overrunning_declared_size() {
        // The element claims more payload than totalImageSize leaves room for.
        let mut buffer = test_image_buffer(4476, 1, 2, &[(0, &[0u8; 64][..])]);
        let length_offset = OTA_HEADER_FIXED_LEN + 2;
        buffer[length_offset..length_offset + 4].copy_from_slice(&70u32.to_le_bytes());

        assert!(matches!(
            parse_image(&buffer),
            Err(CodecError::TruncatedElement { .. })
        ));
    }

    #[test]
    fn rejects_element_table_not_landing_on_total_size() {
        // Shrink the declared size by one byte: the element walk now
        // overshoots it instead of landing exactly.
        let mut buffer = test_image_buffer(4476, 1, 2, &[(0, &[0u8; 64][..])]);
        let total = buffer.len() as u32 - 1;
        buffer[52..56].copy_from_slice(&total.to_le_bytes());

        assert!(matches!(
            parse_image(&buffer),
            Err(CodecError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn parse_is_idempotent() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[9u8; 30][..])]);
        let first = parse_image(&buffer).unwrap();
        let second = parse_image(&buffer).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn parses_conditional_header_fields() {
        let payload = [7u8; 10];
        let mut buffer = test_image_buffer(4476, 1, 2, &[(0, &payload[..])]);

        // Rewrite the header with field control bit 2 set: header grows by
        // 4 bytes of hardware version bounds before the element table.
        buffer[8..10].copy_from_slice(&4u16.to_le_bytes());
        buffer[6..8].copy_from_slice(&60u16.to_le_bytes());
        let mut bounds = vec![1u16.to_le_bytes(), 3u16.to_le_bytes()].concat();
        let mut tail = buffer.split_off(OTA_HEADER_FIXED_LEN);
        buffer.append(&mut bounds);
        buffer.append(&mut tail);
        let total = buffer.len() as u32;
        buffer[52..56].copy_from_slice(&total.to_le_bytes());

        let image = parse_image(&buffer).unwrap();
        assert_eq!(image.header.header_length, 60);
        assert_eq!(image.header.minimum_hardware_version, Some(1));
        assert_eq!(image.header.maximum_hardware_version, Some(3));
        assert_eq!(image.elements.len(), 1);
        assert_eq!(image.elements[0].data, payload);
    }

    #[test]
    fn finds_image_start_behind_prefix() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0, &[1u8; 5][..])]);
        let mut prefixed = vec![0x55u8; 17];
        prefixed.extend_from_slice(&buffer);
        assert_eq!(find_image_start(&prefixed), Some(17));
        assert_eq!(find_image_start(&[0u8; 32]), None);
    }

    #[test]
    fn validates_ebl_container() {
        let ebl = valid_ebl(6);
        let buffer = test_image_buffer(4476, 1, 2, &[(0x0000, &ebl[..])]);
        let image = parse_image(&buffer).unwrap();
        validate_image(&image).unwrap();
    }

    #[test]
    fn validates_gbl_container() {
        let gbl = valid_gbl();
        let buffer = test_image_buffer(4476, 1, 2, &[(0x0000, &gbl[..])]);
        let image = parse_image(&buffer).unwrap();
        validate_image(&image).unwrap();
    }

    #[test]
    fn flipped_byte_fails_crc() {
        let mut ebl = valid_ebl(0);
        // Flip a payload byte; the record structure stays intact.
        ebl[4] ^= 0x01;
        let buffer = test_image_buffer(4476, 1, 2, &[(0x0000, &ebl[..])]);
        let image = parse_image(&buffer).unwrap();
        assert!(matches!(
            validate_image(&image),
            Err(CodecError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn invalid_ebl_padding_is_rejected() {
        let mut ebl = valid_ebl(4);
        let last = ebl.len() - 1;
        ebl[last] = 0x00;
        let buffer = test_image_buffer(4476, 1, 2, &[(0x0000, &ebl[..])]);
        let image = parse_image(&buffer).unwrap();
        assert!(matches!(
            validate_image(&image),
            Err(CodecError::InvalidPadding)
        ));
    }

    #[test]
    fn missing_end_tag_is_truncation() {
        let mut gbl = valid_gbl();
        // Cut off the end record, leaving only the header record.
        gbl.truncate(8 + 4);
        let buffer = test_image_buffer(4476, 1, 2, &[(0x0000, &gbl[..])]);
        let image = parse_image(&buffer).unwrap();
        assert!(matches!(
            validate_image(&image),
            Err(CodecError::TruncatedImage)
        ));
    }

    #[test]
    fn non_container_elements_are_skipped() {
        let buffer = test_image_buffer(4476, 1, 2, &[(0x00f2, b"version-string-only")]);
        let image = parse_image(&buffer).unwrap();
        validate_image(&image).unwrap();
    }
}
