//! Block builders for unit tests.

use ferrite_consensus::{
    block_subsidy, check_proof_of_work, merkle_root, Amount, Block, BlockHeader, ChainParams,
    Hash256, OutPoint, Transaction, TxIn, TxOut,
};

/// `OP_TRUE`.
pub(crate) const ANYONE_CAN_SPEND: &[u8] = &[0x51];

const BASE_TIME: u32 = 1_700_000_000;

pub(crate) fn coinbase(height: i32, tag: u32, value: Amount) -> Transaction {
    let mut script = height.to_le_bytes().to_vec();
    script.extend_from_slice(&tag.to_le_bytes());
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(OutPoint::null(), script)],
        outputs: vec![TxOut::new(value, ANYONE_CAN_SPEND.to_vec())],
        lock_time: 0,
    }
}

pub(crate) fn spend(prevout: OutPoint, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(prevout, vec![])],
        outputs: vec![TxOut::new(value, ANYONE_CAN_SPEND.to_vec())],
        lock_time: 0,
    }
}

/// Grind the nonce until the header meets the network's easiest target.
pub(crate) fn mine(
    params: &ChainParams,
    prev_hash: Hash256,
    time: u32,
    transactions: Vec<Transaction>,
) -> Block {
    let mut header = BlockHeader {
        version: 1,
        prev_hash,
        merkle_root: merkle_root(&transactions),
        time,
        bits: params.pow_limit_bits,
        nonce: 0,
    };
    while check_proof_of_work(&header, params).is_err() {
        header.nonce += 1;
    }
    Block::new(header, transactions)
}

pub(crate) fn coinbase_block(params: &ChainParams, prev_hash: Hash256, height: i32, tag: u32) -> Block {
    let subsidy = block_subsidy(height, params);
    mine(
        params,
        prev_hash,
        BASE_TIME + height as u32,
        vec![coinbase(height, tag, subsidy)],
    )
}

/// Extends one branch block by block.
pub(crate) struct ChainBuilder {
    params: ChainParams,
    tip: Hash256,
    height: i32,
    tag: u32,
}

impl ChainBuilder {
    pub(crate) fn new(params: ChainParams) -> Self {
        let tip = params.genesis_hash();
        Self {
            params,
            tip,
            height: 0,
            tag: 0,
        }
    }

    /// Builder for a branch forking off `tip` at `height`. `tag` keeps the
    /// coinbases of different branches distinct.
    pub(crate) fn fork(params: ChainParams, tip: Hash256, height: i32, tag: u32) -> Self {
        Self {
            params,
            tip,
            height,
            tag,
        }
    }

    pub(crate) fn next_block(&mut self, txs: &[Transaction]) -> Block {
        let height = self.height + 1;
        let mut transactions = vec![coinbase(height, self.tag, block_subsidy(height, &self.params))];
        transactions.extend_from_slice(txs);
        let block = mine(
            &self.params,
            self.tip,
            BASE_TIME + height as u32 + self.tag,
            transactions,
        );
        self.tip = block.hash();
        self.height = height;
        block
    }

    pub(crate) fn tip(&self) -> Hash256 {
        self.tip
    }

    pub(crate) fn height(&self) -> i32 {
        self.height
    }
}
