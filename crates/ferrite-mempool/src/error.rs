//! Error types for the mempool.

use ferrite_consensus::{Amount, Hash256, OutPoint};
use thiserror::Error;

/// Mempool errors.
#[derive(Error, Debug)]
pub enum MempoolError {
    /// Transaction already exists in mempool.
    #[error("Transaction already in mempool: {0}")]
    AlreadyExists(Hash256),

    /// Coinbase transactions only exist inside blocks.
    #[error("Coinbase transaction {0} cannot enter the mempool")]
    Coinbase(Hash256),

    /// An input is already spent by another pool transaction.
    #[error("Double spend detected: input {outpoint} already spent by {spender}")]
    DoubleSpend { outpoint: OutPoint, spender: Hash256 },

    /// Input is neither in the UTXO set nor created by a pool transaction.
    #[error("Input not found: {0}")]
    MissingInput(OutPoint),

    /// Inputs are worth less than the outputs.
    #[error("Inputs worth {value_in} are below outputs worth {value_out}")]
    InBelowOut { value_in: Amount, value_out: Amount },

    /// Transaction too large.
    #[error("Transaction too large: {size} bytes, max {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// Pool is full and the transaction ranks below everything in it.
    #[error("Mempool full: {count} transactions, {bytes} bytes")]
    Full { count: usize, bytes: usize },

    /// Transaction not found.
    #[error("Transaction not found: {0}")]
    NotFound(Hash256),

    /// Consensus error.
    #[error("Consensus error: {0}")]
    Consensus(#[from] ferrite_consensus::ConsensusError),

    /// State error.
    #[error("State error: {0}")]
    State(#[from] ferrite_state::StateError),
}

/// Result type for mempool operations.
pub type MempoolResult<T> = Result<T, MempoolError>;
