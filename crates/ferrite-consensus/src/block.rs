//! Block headers and full blocks.

use crate::encoding::{serialize, Decodable, Decoder, Encodable, Encoder};
use crate::params::HEADER_SIZE;
use crate::{sha256d, ConsensusResult, Hash256, Transaction};

/// 80-byte block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block hash: double SHA-256 of the 80-byte encoding.
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.encode(&mut encoder);
        sha256d(&encoder.into_bytes())
    }

    /// Fixed-size encoding.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&serialize(self));
        out
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_i32(self.version);
        encoder.put_hash(&self.prev_hash);
        encoder.put_hash(&self.merkle_root);
        encoder.put_u32(self.time);
        encoder.put_u32(self.bits);
        encoder.put_u32(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            version: decoder.get_i32()?,
            prev_hash: decoder.get_hash()?,
            merkle_root: decoder.get_hash()?,
            time: decoder.get_u32()?,
            bits: decoder.get_u32()?,
            nonce: decoder.get_u32()?,
        })
    }
}

/// Full block: header plus transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        serialize(self).len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(self)
    }
}

impl Encodable for Block {
    fn encode(&self, encoder: &mut Encoder) {
        self.header.encode(encoder);
        self.transactions.encode(encoder);
    }
}

impl Decodable for Block {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            header: BlockHeader::decode(decoder)?,
            transactions: Vec::<Transaction>::decode(decoder)?,
        })
    }
}
