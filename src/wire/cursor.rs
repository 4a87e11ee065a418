//! Bounds-checked byte cursors.
//!
//! Every read checks the remaining length first and returns
//! [`WireError::Incomplete`] instead of reading past the end. Multi-byte
//! values are big-endian, the byte order of both legacy wire formats.

use crate::core::{WireError, WireResult};

/// Read cursor over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Incomplete {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian 16-bit value.
    pub fn read_u16(&mut self) -> WireResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian 32-bit value.
    pub fn read_u32(&mut self) -> WireResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read exactly `n` raw bytes.
    pub fn read_exact(&mut self, n: usize) -> WireResult<&'a [u8]> {
        self.take(n)
    }

    /// Read a 16-bit length-prefixed byte field.
    pub fn read_bytes(&mut self) -> WireResult<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Read a 16-bit length-prefixed string (lossy UTF-8).
    pub fn read_string(&mut self) -> WireResult<String> {
        Ok(String::from_utf8_lossy(self.read_bytes()?).into_owned())
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> WireResult<()> {
        self.take(n).map(|_| ())
    }
}

/// Append-only writer producing big-endian fields.
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Append one byte.
    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Append a big-endian 16-bit value.
    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a big-endian 32-bit value.
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append raw bytes.
    pub fn put_slice(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Append a 16-bit length prefix followed by `data`.
    pub fn put_bytes(&mut self, data: &[u8]) -> WireResult<&mut Self> {
        let len = u16::try_from(data.len()).map_err(|_| WireError::FieldTooLarge(data.len()))?;
        self.put_u16(len);
        self.buf.extend_from_slice(data);
        Ok(self)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
