//! UTXO entries and block undo records.

use ferrite_consensus::encoding::{Decodable, Decoder, Encodable, Encoder};
use ferrite_consensus::{Amount, ConsensusResult, TxOut};

const FLAG_COINBASE: u8 = 1 << 0;
const FLAG_CONFISCATION: u8 = 1 << 1;

/// Fixed per-entry overhead used for cache accounting.
pub(crate) const COIN_OVERHEAD: usize = 96;

/// An unspent output.
///
/// `script` is `None` when the coin was loaded only to check existence and
/// amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub value: Amount,
    pub script: Option<Vec<u8>>,
    /// Height of the block that created it.
    pub height: i32,
    pub is_coinbase: bool,
    /// Created by a confiscation transaction; exempt from maturity.
    pub is_confiscation: bool,
}

impl Coin {
    pub fn from_output(output: &TxOut, height: i32, is_coinbase: bool, is_confiscation: bool) -> Self {
        Self {
            value: output.value,
            script: Some(output.script_pubkey.clone()),
            height,
            is_coinbase,
            is_confiscation,
        }
    }

    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    /// The output this coin represents; `None` without a script.
    pub fn to_output(&self) -> Option<TxOut> {
        self.script
            .as_ref()
            .map(|script| TxOut::new(self.value, script.clone()))
    }

    /// Subject to the coinbase maturity rule.
    pub fn needs_maturity(&self) -> bool {
        self.is_coinbase && !self.is_confiscation
    }

    pub(crate) fn memory_usage(&self) -> usize {
        COIN_OVERHEAD + self.script.as_ref().map_or(0, Vec::len)
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_coinbase {
            flags |= FLAG_COINBASE;
        }
        if self.is_confiscation {
            flags |= FLAG_CONFISCATION;
        }
        flags
    }

    /// Decode a stored coin, skipping the script bytes.
    pub fn decode_without_script(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut decoder = Decoder::new(bytes);
        let (height, flags, value) = Self::decode_head(&mut decoder)?;
        Ok(Self::assemble(height, flags, value, None))
    }

    fn decode_head(decoder: &mut Decoder<'_>) -> ConsensusResult<(i32, u8, Amount)> {
        Ok((decoder.get_i32()?, decoder.get_u8()?, decoder.get_i64()?))
    }

    fn assemble(height: i32, flags: u8, value: Amount, script: Option<Vec<u8>>) -> Self {
        Self {
            value,
            script,
            height,
            is_coinbase: flags & FLAG_COINBASE != 0,
            is_confiscation: flags & FLAG_CONFISCATION != 0,
        }
    }
}

impl Encodable for Coin {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_i32(self.height);
        encoder.put_u8(self.flags());
        encoder.put_i64(self.value);
        encoder.put_var_bytes(self.script.as_deref().unwrap_or_default());
    }
}

impl Decodable for Coin {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        let (height, flags, value) = Self::decode_head(decoder)?;
        let script = decoder.get_var_bytes()?;
        Ok(Self::assemble(height, flags, value, Some(script)))
    }
}

/// Coins spent by one transaction, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

impl Encodable for TxUndo {
    fn encode(&self, encoder: &mut Encoder) {
        self.spent.encode(encoder);
    }
}

impl Decodable for TxUndo {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            spent: Vec::<Coin>::decode(decoder)?,
        })
    }
}

/// Undo data for a block: one entry per non-coinbase transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl Encodable for BlockUndo {
    fn encode(&self, encoder: &mut Encoder) {
        self.txs.encode(encoder);
    }
}

impl Decodable for BlockUndo {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            txs: Vec::<TxUndo>::decode(decoder)?,
        })
    }
}
