//! Upload framing: the fixed-width metadata header that precedes a raw
//! image body on an upload stream.
//!
//! Four ASCII fields are sent back-to-back, each right-padded with the filler
//! byte to its width, then exactly `file_size` body bytes. The body is never
//! padded. Widths and the filler byte are defined here and nowhere else.
//!
//! ```text
//! | size (10) | name (64) | signature hex (150) | content hash hex (100) | body ... |
//! ```

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Default padding byte.
pub const FILLER: u8 = b':';

pub const SIZE_WIDTH: usize = 10;
pub const NAME_WIDTH: usize = 64;
pub const SIGNATURE_WIDTH: usize = 150;
pub const HASH_WIDTH: usize = 100;

/// Total header size on the wire.
pub const HEADER_LEN: usize = SIZE_WIDTH + NAME_WIDTH + SIGNATURE_WIDTH + HASH_WIDTH;

/// Body bytes are copied in pieces of this size.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Raw header as it sits on the wire.
///
/// Wire size: 324 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TransferHeader {
    /// File size in bytes, ASCII decimal.
    pub file_size: [u8; SIZE_WIDTH],
    /// Original file name. Informational only; receivers never use it as a path.
    pub file_name: [u8; NAME_WIDTH],
    /// Hex Ed25519 signature over the raw 32-byte content hash.
    pub signature: [u8; SIGNATURE_WIDTH],
    /// Hex BLAKE3 of the body.
    pub content_hash: [u8; HASH_WIDTH],
}

assert_eq_size!(TransferHeader, [u8; HEADER_LEN]);

/// Decoded header values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub file_size: u64,
    pub file_name: String,
    pub signature: String,
    pub content_hash: String,
}

impl TransferHeader {
    /// Encode with the standard filler.
    pub fn encode(meta: &TransferMeta) -> Result<Self, HeaderError> {
        Self::encode_with(meta, FILLER)
    }

    /// Encode with a specific filler byte. Values wider than their field, or
    /// ending in the filler byte, are rejected.
    pub fn encode_with(meta: &TransferMeta, filler: u8) -> Result<Self, HeaderError> {
        let mut header = TransferHeader {
            file_size: [filler; SIZE_WIDTH],
            file_name: [filler; NAME_WIDTH],
            signature: [filler; SIGNATURE_WIDTH],
            content_hash: [filler; HASH_WIDTH],
        };
        put(&mut header.file_size, "file_size", &meta.file_size.to_string(), filler)?;
        put(&mut header.file_name, "file_name", &meta.file_name, filler)?;
        put(&mut header.signature, "signature", &meta.signature, filler)?;
        put(&mut header.content_hash, "content_hash", &meta.content_hash, filler)?;
        Ok(header)
    }

    /// Decode with the standard filler.
    pub fn decode(&self) -> Result<TransferMeta, HeaderError> {
        self.decode_with(FILLER)
    }

    /// Trim trailing `filler` from each field and parse the size.
    pub fn decode_with(&self, filler: u8) -> Result<TransferMeta, HeaderError> {
        let size = take(&self.file_size, "file_size", filler)?;
        let file_size = size
            .parse::<u64>()
            .map_err(|_| HeaderError::InvalidSize(size.clone()))?;
        Ok(TransferMeta {
            file_size,
            file_name: take(&self.file_name, "file_name", filler)?,
            signature: take(&self.signature, "signature", filler)?,
            content_hash: take(&self.content_hash, "content_hash", filler)?,
        })
    }

    /// Parse a header from exactly `HEADER_LEN` bytes.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, HeaderError> {
        Self::read_from(bytes).ok_or(HeaderError::Length(bytes.len()))
    }

    /// The header exactly as it goes on the wire.
    pub fn as_wire(&self) -> &[u8] {
        self.as_bytes()
    }
}

fn put(field: &mut [u8], name: &'static str, value: &str, filler: u8) -> Result<(), HeaderError> {
    let bytes = value.as_bytes();
    if bytes.len() > field.len() {
        return Err(HeaderError::TooWide {
            field: name,
            width: field.len(),
            len: bytes.len(),
        });
    }
    if bytes.last() == Some(&filler) {
        return Err(HeaderError::EndsWithFiller(name));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn take(field: &[u8], name: &'static str, filler: u8) -> Result<String, HeaderError> {
    let end = field
        .iter()
        .rposition(|b| *b != filler)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8(field[..end].to_vec()).map_err(|_| HeaderError::NotUtf8(name))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("{field} is {len} bytes, field width is {width}")]
    TooWide {
        field: &'static str,
        width: usize,
        len: usize,
    },
    #[error("{0} ends with the filler byte")]
    EndsWithFiller(&'static str),
    #[error("{0} is not valid UTF-8")]
    NotUtf8(&'static str),
    #[error("invalid file size {0:?}")]
    InvalidSize(String),
    #[error("header must be 324 bytes, got {0}")]
    Length(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TransferMeta {
        TransferMeta {
            file_size: 1_048_577,
            file_name: "busybox.tar".into(),
            signature: "ab".repeat(64),
            content_hash: "cd".repeat(32),
        }
    }

    #[test]
    fn header_is_324_bytes_of_ascii() {
        let header = TransferHeader::encode(&meta()).unwrap();
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), 324);
        assert_eq!(&bytes[..7], b"1048577");
        assert_eq!(&bytes[7..10], b":::");
        assert!(bytes.is_ascii());
    }

    #[test]
    fn decode_is_independent_of_filler() {
        for filler in [b':', b' ', b'#', 0u8] {
            let header = TransferHeader::encode_with(&meta(), filler).unwrap();
            let wire = header.as_bytes().to_vec();
            let decoded = TransferHeader::from_wire(&wire)
                .unwrap()
                .decode_with(filler)
                .unwrap();
            assert_eq!(decoded, meta(), "filler {filler:#x}");
        }
    }

    #[test]
    fn field_wider_than_width_fails_encoding() {
        let mut m = meta();
        m.file_name = "x".repeat(NAME_WIDTH + 1);
        assert_eq!(
            TransferHeader::encode(&m).unwrap_err(),
            HeaderError::TooWide {
                field: "file_name",
                width: NAME_WIDTH,
                len: NAME_WIDTH + 1
            }
        );

        let mut m = meta();
        m.file_size = 10_000_000_000;
        assert!(matches!(
            TransferHeader::encode(&m),
            Err(HeaderError::TooWide { field: "file_size", .. })
        ));
    }

    #[test]
    fn exact_width_value_has_no_padding() {
        let mut m = meta();
        m.file_name = "n".repeat(NAME_WIDTH);
        let decoded = TransferHeader::encode(&m).unwrap().decode().unwrap();
        assert_eq!(decoded.file_name.len(), NAME_WIDTH);
    }

    #[test]
    fn value_ending_in_filler_is_rejected() {
        let mut m = meta();
        m.file_name = "weird:".into();
        assert_eq!(
            TransferHeader::encode(&m).unwrap_err(),
            HeaderError::EndsWithFiller("file_name")
        );
    }

    #[test]
    fn garbage_size_fails_decoding() {
        let mut header = TransferHeader::encode(&meta()).unwrap();
        header.file_size = *b"12ab::::::";
        assert_eq!(
            header.decode().unwrap_err(),
            HeaderError::InvalidSize("12ab".into())
        );
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert_eq!(
            TransferHeader::from_wire(&[b':'; 100]).unwrap_err(),
            HeaderError::Length(100)
        );
    }
}
