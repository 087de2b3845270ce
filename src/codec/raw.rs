//! Raw reader - copies encoded values without decoding them.
//!
//! Used by the pass-through result modes, where the caller wants the
//! server's encoding of a result rather than a materialized value.
//!
//! # Example
//!
//! ```
//! use hprose_client::codec::RawReader;
//!
//! let mut reader = RawReader::new(b"a2{1s2\"ab\"}z");
//! assert_eq!(&reader.read_raw().unwrap()[..], b"a2{1s2\"ab\"}");
//! assert_eq!(&reader.read_raw().unwrap()[..], b"z");
//! ```

use bytes::Bytes;

use super::stream::ByteStream;
use super::tags::*;
use crate::error::{Error, Result};

/// Reader that slices out one complete tagged value at a time.
pub struct RawReader<'a> {
    stream: ByteStream<'a>,
}

impl<'a> RawReader<'a> {
    /// Create a raw reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            stream: ByteStream::new(data),
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.stream.position()
    }

    /// Copy the next value verbatim.
    pub fn read_raw(&mut self) -> Result<Bytes> {
        read_raw(&mut self.stream)
    }
}

/// Copy the next value at the cursor verbatim.
pub(crate) fn read_raw(stream: &mut ByteStream<'_>) -> Result<Bytes> {
    let start = stream.position();
    let tag = stream
        .next()
        .ok_or_else(|| Error::unexpected_tag(None, None))?;
    skip_value(stream, tag)?;
    Ok(Bytes::copy_from_slice(stream.slice(start, stream.position())))
}

/// Advance past the body of a value whose tag was already consumed.
fn skip_value(stream: &mut ByteStream<'_>, tag: u8) -> Result<()> {
    match tag {
        b'0'..=b'9' | TAG_NULL | TAG_EMPTY | TAG_TRUE | TAG_FALSE | TAG_NAN | TAG_END => {}
        TAG_INFINITY => stream.skip(1)?,
        TAG_INTEGER | TAG_LONG | TAG_DOUBLE | TAG_REF => {
            stream.read_until(TAG_SEMICOLON)?;
        }
        TAG_DATE | TAG_TIME => loop {
            let b = stream.read_byte()?;
            if b == TAG_SEMICOLON || b == TAG_UTC {
                break;
            }
        },
        TAG_UTF8_CHAR => {
            stream.read_utf16_units(1)?;
        }
        TAG_BYTES => {
            let count = stream.read_count(TAG_QUOTE)?;
            stream.skip(count + 1)?;
        }
        TAG_STRING => {
            let count = stream.read_count(TAG_QUOTE)?;
            stream.read_utf16_units(count)?;
            stream.skip(1)?;
        }
        TAG_GUID => stream.skip(38)?,
        TAG_LIST | TAG_MAP | TAG_OBJECT => skip_complex(stream)?,
        TAG_CLASS => {
            let count = stream.read_count(TAG_QUOTE)?;
            stream.read_utf16_units(count)?;
            stream.skip(1)?;
            skip_complex(stream)?;
            let next = stream
                .next()
                .ok_or_else(|| Error::unexpected_tag(None, None))?;
            skip_value(stream, next)?;
        }
        TAG_ERROR => {
            let next = stream
                .next()
                .ok_or_else(|| Error::unexpected_tag(None, None))?;
            skip_value(stream, next)?;
        }
        other => return Err(Error::unexpected_tag(Some(other), None)),
    }
    Ok(())
}

/// `<count>{ values }` - the count is skipped, values until `}`.
fn skip_complex(stream: &mut ByteStream<'_>) -> Result<()> {
    stream.read_until(TAG_OPENBRACE)?;
    loop {
        let tag = stream.read_byte()?;
        if tag == TAG_CLOSEBRACE {
            return Ok(());
        }
        skip_value(stream, tag)?;
    }
}
