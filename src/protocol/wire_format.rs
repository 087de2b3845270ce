//! Socket frame header encoding and decoding.
//!
//! Half-duplex frames carry a 4-byte length; full-duplex frames set the top
//! bit of the length and append a 4-byte correlation id:
//! ```text
//! half-duplex   ┌──────────────────┬─────────┐
//!               │ length           │ payload │
//!               │ uint32 BE        │         │
//!               └──────────────────┴─────────┘
//! full-duplex   ┌──────────────────┬──────────┬─────────┐
//!               │ length | 0x8000… │ id       │ payload │
//!               │ uint32 BE        │ uint32 BE│         │
//!               └──────────────────┴──────────┴─────────┘
//! ```

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Header size of a half-duplex frame.
pub const HALF_DUPLEX_HEADER_SIZE: usize = 4;

/// Header size of a full-duplex frame.
pub const FULL_DUPLEX_HEADER_SIZE: usize = 8;

/// Largest header size.
pub const MAX_HEADER_SIZE: usize = FULL_DUPLEX_HEADER_SIZE;

/// Bit of the length word marking a full-duplex header.
pub const FULL_DUPLEX_FLAG: u32 = 0x8000_0000;

/// Largest correlation id; ids wrap to 0 after it.
pub const MAX_REQUEST_ID: u32 = 0x7fff_ffff;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Absolute maximum payload size (the length word has 31 usable bits).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = 0x7fff_ffff;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Correlation id, present on full-duplex frames.
    pub id: Option<u32>,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Header of a half-duplex frame.
    pub fn half_duplex(payload_length: u32) -> Self {
        Self {
            id: None,
            payload_length,
        }
    }

    /// Header of a full-duplex frame.
    pub fn full_duplex(id: u32, payload_length: u32) -> Self {
        Self {
            id: Some(id),
            payload_length,
        }
    }

    /// Encoded size of this header.
    #[inline]
    pub fn size(&self) -> usize {
        if self.id.is_some() {
            FULL_DUPLEX_HEADER_SIZE
        } else {
            HALF_DUPLEX_HEADER_SIZE
        }
    }

    /// Encode into a fixed buffer; only the first [`size`](Self::size)
    /// bytes are meaningful.
    ///
    /// # Example
    ///
    /// ```
    /// use hprose_client::protocol::Header;
    ///
    /// let header = Header::full_duplex(7, 3);
    /// let bytes = header.encode();
    /// assert_eq!(&bytes[..header.size()], &[0x80, 0, 0, 3, 0, 0, 0, 7]);
    /// ```
    pub fn encode(&self) -> [u8; MAX_HEADER_SIZE] {
        let mut buf = [0u8; MAX_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer of at least [`size`](Self::size) bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= self.size());
        match self.id {
            Some(id) => {
                buf[0..4].copy_from_slice(&(self.payload_length | FULL_DUPLEX_FLAG).to_be_bytes());
                buf[4..8].copy_from_slice(&id.to_be_bytes());
            }
            None => buf[0..4].copy_from_slice(&self.payload_length.to_be_bytes()),
        }
    }

    /// Decode from the start of `buf`.
    ///
    /// Returns `None` when `buf` is too short for the header it starts.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < LENGTH_SIZE {
            return None;
        }
        let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if word & FULL_DUPLEX_FLAG == 0 {
            return Some(Self::half_duplex(word));
        }
        if buf.len() < FULL_DUPLEX_HEADER_SIZE {
            return None;
        }
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(Self::full_duplex(id, word & !FULL_DUPLEX_FLAG))
    }

    /// Header size announced by the first length word in `buf`.
    pub fn size_hint(buf: &[u8]) -> Option<usize> {
        if buf.len() < LENGTH_SIZE {
            return None;
        }
        Some(if buf[0] & 0x80 != 0 {
            FULL_DUPLEX_HEADER_SIZE
        } else {
            HALF_DUPLEX_HEADER_SIZE
        })
    }
}

/// Check a payload length against the configured maximum.
pub fn validate_length(payload_length: u32, max_payload_size: u32) -> Result<()> {
    if payload_length > max_payload_size {
        return Err(Error::Protocol(format!(
            "Payload size {payload_length} exceeds maximum {max_payload_size}"
        )));
    }
    Ok(())
}

/// Next correlation id after `id`, wrapping past [`MAX_REQUEST_ID`].
#[inline]
pub fn next_request_id(id: u32) -> u32 {
    if id >= MAX_REQUEST_ID {
        0
    } else {
        id + 1
    }
}
