//! Byte cursor shared by the reader and the raw reader.

use crate::error::{Error, Result};

fn truncated() -> Error {
    Error::Protocol("unexpected end of stream".to_string())
}

/// Forward-only cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub(crate) struct ByteStream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteStream<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes between two positions already consumed.
    pub(crate) fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        &self.data[start..end]
    }

    /// Next byte, or `None` at end of input.
    pub(crate) fn next(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8> {
        self.next().ok_or_else(truncated)
    }

    pub(crate) fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(truncated());
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.read_exact(n).map(|_| ())
    }

    /// Consume the expected byte.
    pub(crate) fn expect(&mut self, tag: u8) -> Result<()> {
        match self.next() {
            Some(b) if b == tag => Ok(()),
            found => Err(Error::unexpected_tag(found, Some(&[tag]))),
        }
    }

    /// Bytes up to `tag`; the delimiter is consumed but not returned.
    pub(crate) fn read_until(&mut self, tag: u8) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let n = rest.iter().position(|&b| b == tag).ok_or_else(truncated)?;
        self.pos += n + 1;
        Ok(&rest[..n])
    }

    /// Decimal integer terminated by `tag`; an empty digit run means zero.
    pub(crate) fn read_int(&mut self, tag: u8) -> Result<i64> {
        let digits = self.read_until(tag)?;
        if digits.is_empty() {
            return Ok(0);
        }
        parse_ascii(digits)
    }

    /// Non-negative count terminated by `tag`.
    pub(crate) fn read_count(&mut self, tag: u8) -> Result<usize> {
        let n = self.read_int(tag)?;
        usize::try_from(n).map_err(|_| Error::Protocol(format!("negative count {n}")))
    }

    /// A UTF-8 run holding `units` UTF-16 code units.
    ///
    /// Sequences of one to three bytes count as one unit, four-byte
    /// sequences as two.
    pub(crate) fn read_utf16_units(&mut self, units: usize) -> Result<&'a str> {
        let start = self.pos;
        let mut counted = 0;
        while counted < units {
            let lead = self.read_byte()?;
            let (len, width) = match lead {
                0x00..=0x7f => (1, 1),
                0xc0..=0xdf => (2, 1),
                0xe0..=0xef => (3, 1),
                0xf0..=0xf7 => (4, 2),
                _ => {
                    return Err(Error::Protocol(format!(
                        "bad utf-8 encoding at byte {start}"
                    )))
                }
            };
            self.skip(len - 1)?;
            counted += width;
        }
        std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|e| Error::Protocol(format!("bad utf-8 encoding: {e}")))
    }
}

/// Parse an ASCII decimal integer.
pub(crate) fn parse_ascii<T: std::str::FromStr>(digits: &[u8]) -> Result<T> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid number \"{}\" in stream",
                String::from_utf8_lossy(digits)
            ))
        })
}
