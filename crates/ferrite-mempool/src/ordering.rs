//! Transaction ordering by fee rate.

use ferrite_consensus::{Amount, Hash256};
use std::cmp::Ordering;

/// Ordering key of a pooled transaction. Iterating a `BTreeSet` of keys
/// yields the best transaction first and the eviction victim last.
#[derive(Debug, Clone)]
pub struct PoolOrder {
    pub txid: Hash256,
    /// Fee in satoshis; `None` for transactions returned from a
    /// disconnected block, which rank as paying nothing.
    pub fee: Option<Amount>,
    pub size: usize,
    /// Arrival sequence number.
    pub sequence: u64,
}

impl PoolOrder {
    pub fn new(txid: Hash256, fee: Option<Amount>, size: usize, sequence: u64) -> Self {
        Self {
            txid,
            fee,
            size,
            sequence,
        }
    }

    /// Fee per 1000 bytes.
    pub fn fee_rate(&self) -> Amount {
        match self.fee {
            Some(fee) if self.size > 0 => fee.saturating_mul(1000) / self.size as Amount,
            _ => 0,
        }
    }
}

impl PartialEq for PoolOrder {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PoolOrder {}

impl PartialOrd for PoolOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PoolOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher fee rate first, then earlier arrival.
        other
            .fee_rate()
            .cmp(&self.fee_rate())
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}
