//! Test data generators for integration tests.
//!
//! Provides block builders, transaction helpers and stand-in collaborators
//! (script checkers, frozen-output sources, mempool sinks) for driving the
//! chain manager.

use ferrite_consensus::{
    block_subsidy, check_proof_of_work, merkle_root, Amount, Block, BlockHeader, ChainParams,
    FrozenOutputs, Hash256, OutPoint, ScriptCheckResult, ScriptChecker, ScriptFlags, Transaction,
    TxIn, TxOut,
};
use ferrite_state::MempoolSink;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Global counter for branch tags
static TAG_COUNTER: AtomicU32 = AtomicU32::new(1);

/// `OP_TRUE`.
pub const ANYONE_CAN_SPEND: &[u8] = &[0x51];

const BASE_TIME: u32 = 1_700_000_000;

/// Generate a branch tag no other builder in this process uses.
pub fn next_tag() -> u32 {
    TAG_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Regtest parameters with coinbase outputs spendable one block later.
pub fn regtest_params() -> ChainParams {
    let mut params = ChainParams::regtest();
    params.coinbase_maturity = 1;
    params
}

/// Coinbase for `height`; `tag` keeps coinbases of sibling blocks distinct.
pub fn coinbase(height: i32, tag: u32, value: Amount) -> Transaction {
    let mut script = height.to_le_bytes().to_vec();
    script.extend_from_slice(&tag.to_le_bytes());
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(OutPoint::null(), script)],
        outputs: vec![TxOut::new(value, ANYONE_CAN_SPEND.to_vec())],
        lock_time: 0,
    }
}

/// Transaction spending every outpoint of `prevouts` into one output.
pub fn spend(prevouts: &[OutPoint], value: Amount) -> Transaction {
    Transaction {
        version: 1,
        inputs: prevouts
            .iter()
            .map(|prevout| TxIn::new(*prevout, vec![]))
            .collect(),
        outputs: vec![TxOut::new(value, ANYONE_CAN_SPEND.to_vec())],
        lock_time: 0,
    }
}

/// First output of the block's coinbase.
pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Grind the nonce until the header meets the network's easiest target.
pub fn mine(params: &ChainParams, prev_hash: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
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

/// Header linking to `prev_hash`, without proof of work. Enough for tree
/// tests, which never check it.
pub fn test_header(params: &ChainParams, prev_hash: Hash256, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_hash,
        merkle_root: Hash256::ZERO,
        time: BASE_TIME,
        bits: params.pow_limit_bits,
        nonce,
    }
}

/// Extends one branch block by block.
#[derive(Debug, Clone)]
pub struct BlockGen {
    params: ChainParams,
    tip: Hash256,
    height: i32,
    tag: u32,
}

impl BlockGen {
    /// Builder for the branch starting at genesis.
    pub fn new(params: &ChainParams) -> Self {
        Self {
            params: params.clone(),
            tip: params.genesis_hash(),
            height: 0,
            tag: 0,
        }
    }

    /// Builder for a new branch on top of `tip` at `height`.
    pub fn fork(params: &ChainParams, tip: Hash256, height: i32) -> Self {
        Self {
            params: params.clone(),
            tip,
            height,
            tag: next_tag(),
        }
    }

    /// Builder continuing from where this one is, under a fresh tag.
    pub fn branch(&self) -> Self {
        Self::fork(&self.params, self.tip, self.height)
    }

    /// Mine the next block with a coinbase followed by `txs`.
    pub fn next(&mut self, txs: &[Transaction]) -> Block {
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

    /// Mine `count` empty blocks.
    pub fn extend(&mut self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.next(&[])).collect()
    }

    pub fn tip(&self) -> Hash256 {
        self.tip
    }

    pub fn height(&self) -> i32 {
        self.height
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Script checker failing any transaction with an input whose script_sig
/// equals the stored bytes.
pub struct RejectScript(pub Vec<u8>);

impl ScriptChecker for RejectScript {
    fn check_inputs(
        &self,
        tx: &Transaction,
        _spent: &[TxOut],
        _flags: ScriptFlags,
        cancel: &CancellationToken,
    ) -> ScriptCheckResult {
        if cancel.is_cancelled() {
            ScriptCheckResult::Cancelled
        } else if tx.inputs.iter().any(|input| input.script_sig == self.0) {
            ScriptCheckResult::Invalid("script rejected".into())
        } else {
            ScriptCheckResult::Valid
        }
    }
}

/// Script checker that takes `delay` per transaction, polling the token.
pub struct SlowScripts {
    delay: Duration,
    checked: AtomicUsize,
    cancelled: AtomicUsize,
}

impl SlowScripts {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            checked: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    /// Transactions that reached a verdict.
    pub fn checked(&self) -> usize {
        self.checked.load(Ordering::SeqCst)
    }

    /// Checks abandoned because the token fired.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ScriptChecker for SlowScripts {
    fn check_inputs(
        &self,
        _tx: &Transaction,
        _spent: &[TxOut],
        _flags: ScriptFlags,
        cancel: &CancellationToken,
    ) -> ScriptCheckResult {
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                return ScriptCheckResult::Cancelled;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.checked.fetch_add(1, Ordering::SeqCst);
        ScriptCheckResult::Valid
    }
}

/// Frozen-output source with a fixed set of frozen outpoints.
#[derive(Default)]
pub struct FreezeOutpoints {
    frozen: Mutex<HashSet<OutPoint>>,
}

impl FreezeOutpoints {
    pub fn freeze(&self, outpoint: OutPoint) {
        self.frozen.lock().insert(outpoint);
    }
}

impl FrozenOutputs for FreezeOutpoints {
    fn is_frozen(&self, outpoint: &OutPoint, _height: i32) -> bool {
        self.frozen.lock().contains(outpoint)
    }
}

/// Mempool event seen by [`RecordingMempool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolEvent {
    Returned(Vec<Hash256>),
    Removed(Vec<Hash256>),
    Scanned(Hash256),
}

/// Mempool sink recording the order of reconciliation calls.
#[derive(Default)]
pub struct RecordingMempool {
    events: Mutex<Vec<MempoolEvent>>,
}

impl RecordingMempool {
    pub fn take_events(&self) -> Vec<MempoolEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl MempoolSink for RecordingMempool {
    fn remove_for_block(&self, txs: &[Transaction]) {
        let txids = txs.iter().map(|tx| tx.txid()).collect();
        self.events.lock().push(MempoolEvent::Removed(txids));
    }

    fn return_to_pool(&self, txs: Vec<Transaction>) {
        let txids = txs.iter().map(|tx| tx.txid()).collect();
        self.events.lock().push(MempoolEvent::Returned(txids));
    }

    fn check_conflicts(&self, tx: &Transaction) -> Vec<Hash256> {
        self.events.lock().push(MempoolEvent::Scanned(tx.txid()));
        Vec::new()
    }
}
