//! Socket frame with its header.
//!
//! # Example
//!
//! ```
//! use hprose_client::protocol::{build_frame, Header};
//!
//! let bytes = build_frame(&Header::half_duplex(3), b"Cz\x00");
//! assert_eq!(bytes.len(), 4 + 3);
//! ```

use bytes::Bytes;

use super::wire_format::Header;

/// A complete socket frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Correlation id, if the frame is full-duplex.
    #[inline]
    pub fn id(&self) -> Option<u32> {
        self.header.id
    }

    /// Whether the frame carries a correlation id.
    #[inline]
    pub fn is_full_duplex(&self) -> bool {
        self.header.id.is_some()
    }
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let size = header.size();
    let mut out = Vec::with_capacity(size + payload.len());
    out.extend_from_slice(&header.encode()[..size]);
    out.extend_from_slice(payload);
    out
}

/// Build a half-duplex frame for `payload`.
pub fn half_duplex_frame(payload: &[u8]) -> Vec<u8> {
    build_frame(&Header::half_duplex(payload.len() as u32), payload)
}

/// Build a full-duplex frame for `payload` with correlation id `id`.
pub fn full_duplex_frame(id: u32, payload: &[u8]) -> Vec<u8> {
    build_frame(&Header::full_duplex(id, payload.len() as u32), payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_duplex_frame_layout() {
        let bytes = half_duplex_frame(b"abc");
        assert_eq!(bytes, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_full_duplex_frame_layout() {
        let bytes = full_duplex_frame(2, b"z");
        assert_eq!(bytes, vec![0x80, 0, 0, 1, 0, 0, 0, 2, b'z']);
    }

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(Header::full_duplex(9, 2), Bytes::from_static(b"hi"));
        assert_eq!(frame.id(), Some(9));
        assert!(frame.is_full_duplex());
        assert_eq!(frame.payload(), b"hi");
    }
}
