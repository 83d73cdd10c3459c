//! Bitcoin wire serialization.
//!
//! Hand-written codec for the consensus wire format: little-endian integers,
//! compact-size varints, and length-prefixed byte vectors. Size bounds are
//! checked before any allocation so a hostile length prefix cannot force a
//! huge buffer.

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::CodecError;
use crate::hash::Hash256;

/// Types that serialize to the Bitcoin wire format.
pub trait Encodable {
    /// Append the wire encoding to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>);

    /// Serialize to a fresh buffer.
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }
}

/// Types that parse from the Bitcoin wire format.
pub trait Decodable: Sized {
    /// Decode from the reader, advancing its position.
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Decode from a byte slice, requiring that all bytes are consumed.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let value = Self::decode_from(&mut r)?;
        if !r.is_empty() {
            return Err(CodecError::TrailingBytes(r.remaining()));
        }
        Ok(value)
    }
}

/// Cursor over a byte slice with bounds-checked reads.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd(self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_hash(&mut self) -> Result<Hash256, CodecError> {
        let b = self.read_bytes(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(Hash256(out))
    }

    /// Read a compact-size varint, rejecting non-canonical encodings.
    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xfc => Ok(first as u64),
            0xfd => {
                let v = self.read_u16()? as u64;
                if v < 0xfd {
                    return Err(CodecError::NonCanonicalSize);
                }
                Ok(v)
            }
            0xfe => {
                let v = self.read_u32()? as u64;
                if v <= u16::MAX as u64 {
                    return Err(CodecError::NonCanonicalSize);
                }
                Ok(v)
            }
            0xff => {
                let v = self.read_u64()?;
                if v <= u32::MAX as u64 {
                    return Err(CodecError::NonCanonicalSize);
                }
                Ok(v)
            }
        }
    }

    /// Read a varint-prefixed byte vector, bounding the allocation.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_varint()?;
        if len > MAX_MESSAGE_SIZE as u64 {
            return Err(CodecError::OversizedAllocation { size: len, max: MAX_MESSAGE_SIZE as u64 });
        }
        Ok(self.read_bytes(len as usize)?.to_vec())
    }

    /// Read a varint element count, bounding it against the remaining bytes
    /// so a hostile count cannot drive a huge `Vec::with_capacity`.
    pub fn read_count(&mut self, min_elem_size: usize) -> Result<usize, CodecError> {
        let count = self.read_varint()?;
        let bound = (self.remaining() / min_elem_size.max(1)) as u64 + 1;
        if count > bound {
            return Err(CodecError::OversizedAllocation { size: count, max: bound });
        }
        Ok(count as usize)
    }
}

/// Append a compact-size varint in canonical form.
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0x00..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Append a varint-prefixed byte string.
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Serialized length of a compact-size varint.
pub fn varint_len(value: u64) -> usize {
    match value {
        0x00..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

impl Encodable for Hash256 {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }
}

impl Decodable for Hash256 {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.read_hash()
    }
}
