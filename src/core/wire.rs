//! # Wire Primitives
//!
//! Little-endian cursor used by every decoder, plus the null-terminated string writer.
//!
//! Reading never panics: every accessor checks the remaining length first and returns
//! `ProtocolError::WrongHeader` when the datagram is shorter than its structure claims.
//! Writing goes straight to `bytes::BytesMut` through `BufMut`.

use bytes::{BufMut, BytesMut};

use crate::error::{constants, ProtocolError, Result};

/// Bounds-checked little-endian reader over a borrowed datagram
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Look at the next byte without consuming it
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consume `n` bytes
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::wrong_header(constants::ERR_TRUNCATED));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Optional trailing `i32`: absent when fewer than four bytes remain
    pub fn read_optional_i32(&mut self) -> Result<Option<i32>> {
        if self.remaining() < 4 {
            return Ok(None);
        }
        self.read_i32().map(Some)
    }

    /// Read bytes up to (and consuming) the next `0x00`.
    ///
    /// Invalid UTF-8 is replaced rather than rejected, so third-party servers that send
    /// Latin-1 names still decode.
    pub fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtocolError::wrong_header(constants::ERR_MISSING_TERMINATOR))?;
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(text)
    }

    /// Everything that has not been read yet
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Write `value` followed by its `0x00` terminator
pub fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.reserve(value.len() + 1);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}
