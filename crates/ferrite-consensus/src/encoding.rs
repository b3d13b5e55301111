//! Wire encoding.
//!
//! Integers are little-endian, variable-length counts use the compact-size
//! form (`< 0xfd` inline, then `0xfd`/`0xfe`/`0xff` prefixed u16/u32/u64).

use crate::{ConsensusError, ConsensusResult, Hash256};

/// Types with a canonical byte encoding.
pub trait Encodable {
    /// Append the encoding to `encoder`.
    fn encode(&self, encoder: &mut Encoder);
}

/// Types that can be decoded from their canonical encoding.
pub trait Decodable: Sized {
    /// Read one value from `decoder`.
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self>;
}

/// Encode a value into a fresh buffer.
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.encode(&mut encoder);
    encoder.into_bytes()
}

/// Decode a value, requiring every byte to be consumed.
pub fn deserialize<T: Decodable>(bytes: &[u8]) -> ConsensusResult<T> {
    let mut decoder = Decoder::new(bytes);
    let value = T::decode(&mut decoder)?;
    if decoder.remaining() != 0 {
        return Err(ConsensusError::Decode(format!(
            "{} trailing bytes",
            decoder.remaining()
        )));
    }
    Ok(value)
}

/// Byte sink.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash.as_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Compact-size count.
    pub fn put_compact_size(&mut self, n: u64) {
        match n {
            0..=0xfc => self.put_u8(n as u8),
            0xfd..=0xffff => {
                self.put_u8(0xfd);
                self.buf.extend_from_slice(&(n as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.put_u8(0xfe);
                self.put_u32(n as u32);
            }
            _ => {
                self.put_u8(0xff);
                self.put_u64(n);
            }
        }
    }

    /// Length-prefixed byte string.
    pub fn put_var_bytes(&mut self, bytes: &[u8]) {
        self.put_compact_size(bytes.len() as u64);
        self.put_bytes(bytes);
    }
}

/// Byte source over a borrowed slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, n: usize) -> ConsensusResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ConsensusError::Decode(format!(
                "need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> ConsensusResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> ConsensusResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> ConsensusResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn get_u32(&mut self) -> ConsensusResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn get_i32(&mut self) -> ConsensusResult<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn get_u64(&mut self) -> ConsensusResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn get_i64(&mut self) -> ConsensusResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn get_hash(&mut self) -> ConsensusResult<Hash256> {
        Ok(Hash256(self.array()?))
    }

    /// Compact-size count; non-canonical encodings are rejected.
    pub fn get_compact_size(&mut self) -> ConsensusResult<u64> {
        let (value, min) = match self.get_u8()? {
            0xfd => (self.get_u16()? as u64, 0xfd),
            0xfe => (self.get_u32()? as u64, 0x1_0000),
            0xff => (self.get_u64()?, 0x1_0000_0000),
            n => return Ok(n as u64),
        };
        if value < min {
            return Err(ConsensusError::Decode(format!(
                "non-canonical compact size {}",
                value
            )));
        }
        Ok(value)
    }

    /// Count that must fit in the remaining input, assuming each element
    /// takes at least `min_element_size` bytes.
    pub fn get_count(&mut self, min_element_size: usize) -> ConsensusResult<usize> {
        let n = self.get_compact_size()?;
        let max = (self.remaining() / min_element_size.max(1)) as u64;
        if n > max {
            return Err(ConsensusError::Decode(format!(
                "count {} exceeds remaining input",
                n
            )));
        }
        Ok(n as usize)
    }

    /// Length-prefixed byte string.
    pub fn get_var_bytes(&mut self) -> ConsensusResult<Vec<u8>> {
        let len = self.get_count(1)?;
        Ok(self.take(len)?.to_vec())
    }
}

impl Encodable for Hash256 {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_hash(self);
    }
}

impl Decodable for Hash256 {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        decoder.get_hash()
    }
}

impl<T: Encodable> Encodable for [T] {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_compact_size(self.len() as u64);
        for item in self {
            item.encode(encoder);
        }
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode(&self, encoder: &mut Encoder) {
        self.as_slice().encode(encoder);
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        let n = decoder.get_count(1)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(T::decode(decoder)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_size_boundaries() {
        for (n, len) in [
            (0u64, 1usize),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x1_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ] {
            let mut enc = Encoder::new();
            enc.put_compact_size(n);
            let bytes = enc.into_bytes();
            assert_eq!(bytes.len(), len, "length for {}", n);
            assert_eq!(Decoder::new(&bytes).get_compact_size().unwrap(), n);
        }
    }

    #[test]
    fn test_non_canonical_compact_size_rejected() {
        let bytes = [0xfd, 0x10, 0x00];
        assert!(Decoder::new(&bytes).get_compact_size().is_err());
    }

    #[test]
    fn test_oversized_count_rejected() {
        let mut enc = Encoder::new();
        enc.put_compact_size(1_000);
        enc.put_bytes(&[0u8; 10]);
        let bytes = enc.into_bytes();
        assert!(Decoder::new(&bytes).get_var_bytes().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Hash256::ZERO.as_bytes().to_vec();
        assert!(deserialize::<Hash256>(&bytes).is_ok());
        bytes.push(0);
        assert!(deserialize::<Hash256>(&bytes).is_err());
    }
}
