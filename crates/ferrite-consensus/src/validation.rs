//! Context-free block and transaction checks.
//!
//! These rules depend only on the block itself and the network parameters.
//! Rules that need the UTXO set live with the chain manager.

use crate::params::{MAX_COINBASE_SCRIPT_LEN, MAX_HALVINGS, MAX_MONEY, MIN_COINBASE_SCRIPT_LEN, INITIAL_SUBSIDY};
use crate::{sha256d, Amount, Block, ChainParams, ConsensusError, ConsensusResult, Hash256, Transaction};
use std::collections::HashSet;
use tracing::{instrument, trace};

/// Whether `value` is a valid amount.
pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Merkle root over the transaction ids. Odd levels duplicate their last
/// element.
pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    let mut level: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    if level.is_empty() {
        return Hash256::ZERO;
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(pair[0].as_bytes());
                buf[32..].copy_from_slice(pair[1].as_bytes());
                sha256d(&buf)
            })
            .collect();
    }
    level[0]
}

/// Subsidy for a block at `height`.
pub fn block_subsidy(height: i32, params: &ChainParams) -> Amount {
    let halvings = (height.max(0) / params.subsidy_halving_interval.max(1)) as u32;
    if halvings >= MAX_HALVINGS {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> ConsensusResult<()> {
    let txid = tx.txid();
    if tx.inputs.is_empty() {
        return Err(ConsensusError::EmptyInputs { txid });
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::EmptyOutputs { txid });
    }

    let mut total: Amount = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(ConsensusError::NegativeOutput { txid });
        }
        if output.value > MAX_MONEY {
            return Err(ConsensusError::OutputTooLarge { txid });
        }
        total += output.value;
        if !money_range(total) {
            return Err(ConsensusError::OutputTotalTooLarge { txid });
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ConsensusError::DuplicateInputs {
                txid,
                outpoint: input.prevout,
            });
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(ConsensusError::BadCoinbaseLength(len));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(ConsensusError::NullPrevout { txid });
    }
    Ok(())
}

/// Context-free block checks: size, coinbase placement, merkle root,
/// duplicate transactions and every transaction's own checks.
#[instrument(skip(block, params), fields(hash = %block.hash()))]
pub fn check_block(block: &Block, params: &ChainParams) -> ConsensusResult<()> {
    let size = block.size();
    if block.transactions.is_empty() || size > params.max_block_size {
        return Err(ConsensusError::BadBlockLength {
            size,
            max: params.max_block_size,
        });
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::MissingCoinbase);
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ConsensusError::MultipleCoinbase);
    }

    if merkle_root(&block.transactions) != block.header.merkle_root {
        return Err(ConsensusError::BadMerkleRoot);
    }

    let mut txids = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let txid = tx.txid();
        if !txids.insert(txid) {
            return Err(ConsensusError::DuplicateTransaction { txid });
        }
        check_transaction(tx)?;
    }

    trace!(txs = block.transactions.len(), size, "Block passed structural checks");
    Ok(())
}
