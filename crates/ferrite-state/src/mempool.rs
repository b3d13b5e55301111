//! Mempool collaborator contract.
//!
//! The chain manager owns the ordering of reconciliation during a
//! reorganization: transactions of disconnected blocks are returned first,
//! then each connected block removes its transactions. Pool transactions
//! spending the same inputs go with them.

use ferrite_consensus::{Hash256, Transaction};

pub trait MempoolSink: Send + Sync {
    /// Remove transactions included in a newly connected block, and every
    /// pool transaction spending one of their inputs with its descendants.
    fn remove_for_block(&self, txs: &[Transaction]);

    /// Re-admit transactions from disconnected blocks, oldest first.
    fn return_to_pool(&self, txs: Vec<Transaction>);

    /// Pool transactions spending any input of `tx`.
    fn check_conflicts(&self, tx: &Transaction) -> Vec<Hash256>;
}

/// Mempool that holds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMempool;

impl MempoolSink for NullMempool {
    fn remove_for_block(&self, _txs: &[Transaction]) {}

    fn return_to_pool(&self, _txs: Vec<Transaction>) {}

    fn check_conflicts(&self, _tx: &Transaction) -> Vec<Hash256> {
        Vec::new()
    }
}
