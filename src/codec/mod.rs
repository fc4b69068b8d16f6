//! Wire codec
//!
//! Turns a byte stream into [`Packet`](crate::protocol::Packet)s and back for
//! MQTT 3.1.1 and 5.0. Decoding is incremental: a call against a byte run that
//! does not yet hold a complete packet reports "need more data" and consumes
//! nothing, so the codec can sit on top of any streaming transport.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Largest value a variable byte integer can carry (four 7-bit groups)
pub const MAX_VARIABLE_INT: u32 = 268_435_455;

/// Default inbound packet size limit
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Decode a variable byte integer from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends while the continuation bit is still
/// set. A fifth continuation byte is a protocol violation.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut value: u32 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::VariableIntTooLong);
        }
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(DecodeError::VariableIntTooLong);
    }
    Ok(None)
}

/// Append `value` as a variable byte integer, returning the bytes written
pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value > MAX_VARIABLE_INT {
        return Err(EncodeError::VariableIntOverflow(u64::from(value)));
    }
    let mut rest = value;
    let mut written = 0;
    loop {
        let mut byte = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        written += 1;
        if rest == 0 {
            return Ok(written);
        }
    }
}

#[inline]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Cursor over the body of one complete packet.
///
/// Running off the end means the remaining length lied about the body, so
/// every read failure is a `Truncated` decode error, never "need more data".
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn variable_int(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        match read_variable_int(&self.buf[self.pos..])? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(DecodeError::Truncated(what)),
        }
    }

    /// UTF-8 string with a two byte length prefix. U+0000 is not allowed.
    pub(crate) fn string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let len = self.u16(what)? as usize;
        let raw = self.take(len, what)?;
        let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        if s.contains('\0') {
            return Err(DecodeError::Malformed("string contains U+0000"));
        }
        Ok(s.to_owned())
    }

    pub(crate) fn binary(&mut self, what: &'static str) -> Result<Bytes, DecodeError> {
        let len = self.u16(what)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, what)?))
    }

    /// Everything left in the body
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Split off the next `len` bytes as their own reader
    pub(crate) fn sub(&mut self, len: usize, what: &'static str) -> Result<Reader<'a>, DecodeError> {
        Ok(Reader::new(self.take(len, what)?))
    }
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    put_binary(buf, s.as_bytes())
}

pub(crate) fn put_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong(data.len()))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}
