//! Primitive binary writer/reader shared by the snapshot, fingerprint,
//! any-value and cache-entry streams.
//!
//! Integers that are usually small (lengths, counts, timestamps, file sizes)
//! use unsigned LEB128 varints; negative `i64` values are written as their
//! two's-complement bits and therefore take the full ten bytes.

use crate::error::DecodeError;
use crate::hash::{ContentHash, HASH_LEN};

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_byte(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Fixed-width big-endian `i64`.
    pub fn write_long(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_var_long(&mut self, value: i64) {
        self.write_var_u64(value as u64);
    }

    pub fn write_small_int(&mut self, value: usize) {
        self.write_var_u64(value as u64);
    }

    fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_binary(value.as_bytes());
    }

    /// Length-prefixed byte array.
    pub fn write_binary(&mut self, value: &[u8]) {
        self.write_small_int(value.len());
        self.buf.extend_from_slice(value);
    }

    pub fn write_hash(&mut self, hash: &ContentHash) {
        self.buf.extend_from_slice(hash.as_bytes());
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let eof = DecodeError::UnexpectedEof {
            needed: n,
            offset: self.pos,
            available: self.remaining(),
        };
        let end = self.pos.checked_add(n).ok_or_else(|| eof.clone())?;
        if end > self.buf.len() {
            return Err(eof);
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        let offset = self.pos;
        match self.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::UnknownTag {
                kind: "boolean",
                tag,
                offset,
            }),
        }
    }

    pub fn read_long(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn read_var_long(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_var_u64()? as i64)
    }

    pub fn read_small_int(&mut self) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let value = self.read_var_u64()?;
        usize::try_from(value).map_err(|_| DecodeError::VarintOverflow {
            offset,
            bits: usize::BITS,
        })
    }

    fn read_var_u64(&mut self) -> Result<u64, DecodeError> {
        let offset = self.pos;
        let mut value = 0_u64;
        let mut shift = 0_u32;
        loop {
            let byte = self.read_byte()?;
            let bits = u64::from(byte & 0x7f);
            if shift == 63 && bits > 1 {
                return Err(DecodeError::VarintOverflow { offset, bits: 64 });
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow { offset, bits: 64 });
            }
        }
    }

    pub fn read_binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_small_int()?;
        self.take(len)
    }

    pub fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        let offset = self.pos;
        let bytes = self.read_binary()?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        self.read_str().map(str::to_owned)
    }

    pub fn read_hash(&mut self) -> Result<ContentHash, DecodeError> {
        let bytes = self.take(HASH_LEN)?;
        let mut raw = [0_u8; HASH_LEN];
        raw.copy_from_slice(bytes);
        Ok(ContentHash::from_raw(raw))
    }
}
