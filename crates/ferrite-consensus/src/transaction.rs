//! Transactions and outpoints.

use crate::encoding::{serialize, Decodable, Decoder, Encodable, Encoder};
use crate::params::CONFISCATION_MARKER;
use crate::{sha256d, Amount, ConsensusResult, Hash256};
use std::fmt;

/// Reference to one output of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    /// Encoded length.
    pub const SIZE: usize = 36;

    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The outpoint referenced by coinbase inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }

    /// Fixed-width key, ordered by txid then index.
    pub fn to_key(&self) -> [u8; Self::SIZE] {
        let mut key = [0u8; Self::SIZE];
        key[..32].copy_from_slice(self.txid.as_bytes());
        key[32..].copy_from_slice(&self.vout.to_be_bytes());
        key
    }

    /// Inverse of [`OutPoint::to_key`].
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != Self::SIZE {
            return None;
        }
        let txid = Hash256::from_slice(&key[..32])?;
        let vout = u32::from_be_bytes(key[32..].try_into().ok()?);
        Some(Self { txid, vout })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encodable for OutPoint {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_hash(&self.txid);
        encoder.put_u32(self.vout);
    }
}

impl Decodable for OutPoint {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            txid: decoder.get_hash()?,
            vout: decoder.get_u32()?,
        })
    }
}

/// Transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: u32::MAX,
        }
    }
}

impl Encodable for TxIn {
    fn encode(&self, encoder: &mut Encoder) {
        self.prevout.encode(encoder);
        encoder.put_var_bytes(&self.script_sig);
        encoder.put_u32(self.sequence);
    }
}

impl Decodable for TxIn {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            prevout: OutPoint::decode(decoder)?,
            script_sig: decoder.get_var_bytes()?,
            sequence: decoder.get_u32()?,
        })
    }
}

/// Transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// Provably unspendable (`OP_RETURN` or `OP_FALSE OP_RETURN`); such
    /// outputs never enter the UTXO set.
    pub fn is_unspendable(&self) -> bool {
        matches!(self.script_pubkey.as_slice(), [0x6a, ..] | [0x00, 0x6a, ..])
    }
}

impl Encodable for TxOut {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_i64(self.value);
        encoder.put_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            value: decoder.get_i64()?,
            script_pubkey: decoder.get_var_bytes()?,
        })
    }
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Double SHA-256 of the encoding.
    pub fn txid(&self) -> Hash256 {
        sha256d(&serialize(self))
    }

    /// Single input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Whether the first output carries the confiscation marker.
    ///
    /// Outputs created by a confiscation transaction are exempt from the
    /// coinbase maturity rule.
    pub fn is_confiscation(&self) -> bool {
        !self.is_coinbase()
            && self
                .outputs
                .first()
                .map_or(false, |out| out.script_pubkey.starts_with(CONFISCATION_MARKER))
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        serialize(self).len()
    }

    /// Sum of output values; `None` on overflow.
    pub fn output_total(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0 as Amount, |acc, out| acc.checked_add(out.value))
    }
}

impl Encodable for Transaction {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_i32(self.version);
        self.inputs.encode(encoder);
        self.outputs.encode(encoder);
        encoder.put_u32(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            version: decoder.get_i32()?,
            inputs: Vec::<TxIn>::decode(decoder)?,
            outputs: Vec::<TxOut>::decode(decoder)?,
            lock_time: decoder.get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::deserialize;

    fn spend(prev: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(prev, vec![0x51])],
            outputs: vec![TxOut::new(value, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn test_outpoint_key_orders_by_txid_then_index() {
        let a = OutPoint::new(Hash256([1; 32]), 2);
        let b = OutPoint::new(Hash256([1; 32]), 10);
        assert!(a.to_key() < b.to_key());
        assert_eq!(OutPoint::from_key(&b.to_key()), Some(b));
    }

    #[test]
    fn test_coinbase_detection() {
        let coinbase = spend(OutPoint::null(), 50);
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_confiscation());

        let regular = spend(OutPoint::new(Hash256([2; 32]), 0), 10);
        assert!(!regular.is_coinbase());
    }

    #[test]
    fn test_confiscation_marker() {
        let mut tx = spend(OutPoint::new(Hash256([3; 32]), 0), 0);
        tx.outputs[0].script_pubkey = CONFISCATION_MARKER.to_vec();
        tx.outputs.push(TxOut::new(10, vec![0x51]));
        assert!(tx.is_confiscation());
    }

    #[test]
    fn test_unspendable_outputs() {
        assert!(TxOut::new(0, vec![0x6a, 0x01, 0xff]).is_unspendable());
        assert!(TxOut::new(0, CONFISCATION_MARKER.to_vec()).is_unspendable());
        assert!(!TxOut::new(0, vec![0x51]).is_unspendable());
        assert!(!TxOut::new(0, vec![]).is_unspendable());
    }

    #[test]
    fn test_decode_matches_encoding() {
        let tx = spend(OutPoint::new(Hash256([4; 32]), 1), 1234);
        let bytes = serialize(&tx);
        assert_eq!(bytes.len(), tx.size());
        let decoded: Transaction = deserialize(&bytes).unwrap();
        assert_eq!(decoded.txid(), tx.txid());
    }
}
