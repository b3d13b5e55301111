//! Transaction pool with an input spend index.
//!
//! - Every pooled transaction is keyed by txid
//! - `spends` maps each outpoint spent by a pooled transaction to its
//!   spender, giving double-spend detection and descendant lookup
//! - The fee-rate order picks eviction victims when a limit is exceeded
//!
//! Mutations are serialized by a writer lock; lookups read the maps
//! directly.

use crate::ordering::PoolOrder;
use crate::{MempoolError, MempoolResult, DEFAULT_MAX_BYTES, DEFAULT_MAX_TXS};
use dashmap::DashMap;
use ferrite_consensus::{
    check_transaction, money_range, Amount, ConsensusError, Hash256, OutPoint, Transaction, TxOut,
};
use ferrite_state::{MempoolSink, UtxoSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

/// Mempool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum number of transactions.
    pub max_transactions: usize,
    /// Maximum total serialized size in bytes.
    pub max_bytes: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: DEFAULT_MAX_TXS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Stored transaction in the mempool.
#[derive(Debug, Clone)]
pub struct PooledTransaction {
    pub txid: Hash256,
    pub tx: Transaction,
    pub size: usize,
    /// Known when admitted against the UTXO set; `None` when returned from
    /// a disconnected block.
    pub fee: Option<Amount>,
    pub sequence: u64,
}

impl PooledTransaction {
    fn order(&self) -> PoolOrder {
        PoolOrder::new(self.txid, self.fee, self.size, self.sequence)
    }
}

/// Mempool statistics.
#[derive(Debug, Clone, Default)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_bytes: usize,
    /// Lowest fee per 1000 bytes.
    pub min_fee_rate: Amount,
    /// Highest fee per 1000 bytes.
    pub max_fee_rate: Amount,
}

/// Transaction mempool.
pub struct Mempool {
    config: MempoolConfig,

    /// Transactions by txid.
    transactions: DashMap<Hash256, PooledTransaction>,

    /// Outpoint -> txid of the pooled transaction spending it.
    spends: DashMap<OutPoint, Hash256>,

    /// Fee-rate order, best first.
    order: RwLock<BTreeSet<PoolOrder>>,

    total_bytes: RwLock<usize>,

    next_sequence: AtomicU64,

    writer: Mutex<()>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            transactions: DashMap::new(),
            spends: DashMap::new(),
            order: RwLock::new(BTreeSet::new()),
            total_bytes: RwLock::new(0),
            next_sequence: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MempoolConfig::default())
    }

    /// Admit a loose transaction.
    ///
    /// Every input must be an unspent coin of `utxo` or an output of a
    /// pooled transaction. Coins pulled into the UTXO cache only for a
    /// refused attempt are uncached again.
    #[instrument(skip(self, tx, utxo), fields(txid = %tx.txid()))]
    pub fn accept_to_pool(&self, tx: Transaction, utxo: &UtxoSet) -> MempoolResult<Hash256> {
        let txid = tx.txid();
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase(txid));
        }
        check_transaction(&tx)?;

        let _writer = self.writer.lock();
        self.check_admissible(&tx, txid)?;

        let fresh: Vec<OutPoint> = tx
            .inputs
            .iter()
            .map(|input| input.prevout)
            .filter(|prevout| !utxo.is_cached(prevout))
            .collect();

        let fee = match self.compute_fee(&tx, txid, utxo) {
            Ok(fee) => fee,
            Err(err) => {
                let uncached = utxo.uncache(&fresh);
                debug!(uncached, error = %err, "Transaction refused");
                return Err(err);
            }
        };

        self.insert(tx, txid, Some(fee));
        self.enforce_limits();
        if !self.transactions.contains_key(&txid) {
            return Err(MempoolError::Full {
                count: self.transactions.len(),
                bytes: *self.total_bytes.read(),
            });
        }
        debug!(fee, count = self.transactions.len(), "Transaction added to mempool");
        Ok(txid)
    }

    fn check_admissible(&self, tx: &Transaction, txid: Hash256) -> MempoolResult<()> {
        if self.transactions.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid));
        }
        let size = tx.size();
        let max = self.config.max_bytes / 10;
        if size > max {
            return Err(MempoolError::TooLarge { size, max });
        }
        for input in &tx.inputs {
            if let Some(spender) = self.spends.get(&input.prevout) {
                return Err(MempoolError::DoubleSpend {
                    outpoint: input.prevout,
                    spender: *spender,
                });
            }
        }
        Ok(())
    }

    fn compute_fee(&self, tx: &Transaction, txid: Hash256, utxo: &UtxoSet) -> MempoolResult<Amount> {
        let view = utxo.read_view();
        let mut value_in: Amount = 0;
        for input in &tx.inputs {
            let value = match self.pool_output(&input.prevout) {
                Some(output) => output.value,
                None => {
                    view.get(&input.prevout)?
                        .ok_or(MempoolError::MissingInput(input.prevout))?
                        .value
                }
            };
            value_in = value_in
                .checked_add(value)
                .filter(|v| money_range(*v))
                .ok_or(ConsensusError::InputValuesOutOfRange { txid })?;
        }

        let value_out = tx
            .output_total()
            .ok_or(ConsensusError::OutputTotalTooLarge { txid })?;
        if value_in < value_out {
            return Err(MempoolError::InBelowOut { value_in, value_out });
        }
        Ok(value_in - value_out)
    }

    /// Output created by a pooled transaction.
    fn pool_output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.transactions
            .get(&outpoint.txid)
            .and_then(|entry| entry.tx.outputs.get(outpoint.vout as usize).cloned())
    }

    fn insert(&self, tx: Transaction, txid: Hash256, fee: Option<Amount>) {
        let entry = PooledTransaction {
            txid,
            size: tx.size(),
            fee,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        for input in &entry.tx.inputs {
            self.spends.insert(input.prevout, txid);
        }
        self.order.write().insert(entry.order());
        *self.total_bytes.write() += entry.size;
        self.transactions.insert(txid, entry);
    }

    /// Remove one transaction, leaving its descendants in place.
    fn remove_entry(&self, txid: &Hash256) -> Option<PooledTransaction> {
        let (_, entry) = self.transactions.remove(txid)?;
        for input in &entry.tx.inputs {
            self.spends.remove_if(&input.prevout, |_, spender| spender == txid);
        }
        self.order.write().remove(&entry.order());
        *self.total_bytes.write() -= entry.size;
        Some(entry)
    }

    /// Remove `root` and every pooled transaction that spends its outputs,
    /// transitively.
    fn remove_with_descendants(&self, root: Hash256) -> usize {
        let mut removed = 0;
        let mut queue = VecDeque::from([root]);
        while let Some(txid) = queue.pop_front() {
            let Some(entry) = self.remove_entry(&txid) else {
                continue;
            };
            removed += 1;
            for vout in 0..entry.tx.outputs.len() as u32 {
                if let Some(child) = self.spends.get(&OutPoint::new(txid, vout)) {
                    queue.push_back(*child);
                }
            }
        }
        removed
    }

    fn enforce_limits(&self) {
        loop {
            let over = self.transactions.len() > self.config.max_transactions
                || *self.total_bytes.read() > self.config.max_bytes;
            if !over {
                break;
            }
            let victim = self.order.read().iter().next_back().map(|o| o.txid);
            let Some(victim) = victim else {
                break;
            };
            let evicted = self.remove_with_descendants(victim);
            warn!(txid = %victim, evicted, "Evicted lowest fee-rate transaction");
        }
    }

    /// Remove a transaction and its descendants.
    pub fn remove(&self, txid: &Hash256) -> MempoolResult<usize> {
        let _writer = self.writer.lock();
        if !self.transactions.contains_key(txid) {
            return Err(MempoolError::NotFound(*txid));
        }
        Ok(self.remove_with_descendants(*txid))
    }

    pub fn get(&self, txid: &Hash256) -> Option<PooledTransaction> {
        self.transactions.get(txid).map(|r| r.clone())
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.transactions.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Pooled transaction spending `outpoint`.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spends.get(outpoint).map(|r| *r)
    }

    /// Transactions ordered by fee rate, best first.
    pub fn by_fee_rate(&self, limit: usize) -> Vec<PooledTransaction> {
        let order = self.order.read();
        order
            .iter()
            .take(limit)
            .filter_map(|o| self.get(&o.txid))
            .collect()
    }

    pub fn stats(&self) -> MempoolStats {
        let order = self.order.read();
        MempoolStats {
            tx_count: self.transactions.len(),
            total_bytes: *self.total_bytes.read(),
            min_fee_rate: order.iter().next_back().map_or(0, PoolOrder::fee_rate),
            max_fee_rate: order.iter().next().map_or(0, PoolOrder::fee_rate),
        }
    }

    pub fn clear(&self) {
        let _writer = self.writer.lock();
        self.transactions.clear();
        self.spends.clear();
        self.order.write().clear();
        *self.total_bytes.write() = 0;
        info!("Mempool cleared");
    }
}

impl MempoolSink for Mempool {
    fn remove_for_block(&self, txs: &[Transaction]) {
        let _writer = self.writer.lock();
        let mut confirmed = 0;
        let mut conflicts = 0;
        for tx in txs {
            let txid = tx.txid();
            if self.remove_entry(&txid).is_some() {
                confirmed += 1;
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                let spender = self.spends.get(&input.prevout).map(|r| *r);
                if let Some(spender) = spender {
                    if spender != txid {
                        conflicts += self.remove_with_descendants(spender);
                    }
                }
            }
        }
        debug!(confirmed, conflicts, remaining = self.transactions.len(), "Mempool updated for block");
    }

    fn return_to_pool(&self, txs: Vec<Transaction>) {
        let _writer = self.writer.lock();
        let offered = txs.len();
        let mut returned = 0;
        for tx in txs {
            if tx.is_coinbase() {
                continue;
            }
            let txid = tx.txid();
            if self.transactions.contains_key(&txid) {
                continue;
            }
            if tx.inputs.iter().any(|i| self.spends.contains_key(&i.prevout)) {
                debug!(txid = %txid, "Returned transaction conflicts with the pool");
                continue;
            }
            self.insert(tx, txid, None);
            returned += 1;
        }
        self.enforce_limits();
        debug!(offered, returned, "Transactions returned to mempool");
    }

    fn check_conflicts(&self, tx: &Transaction) -> Vec<Hash256> {
        let txid = tx.txid();
        let mut conflicts = HashSet::new();
        for input in &tx.inputs {
            if let Some(spender) = self.spends.get(&input.prevout) {
                if *spender != txid {
                    conflicts.insert(*spender);
                }
            }
        }
        conflicts.into_iter().collect()
    }
}
