//! Error types for consensus validation.

use crate::{Amount, Hash256, OutPoint};
use thiserror::Error;

/// Consensus validation errors.
///
/// Every variant maps to a short rejection reason and a ban score that peers
/// relaying the offending data are charged with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Bytes could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Header hash does not meet its own target.
    #[error("Proof of work failed: hash {hash} above target")]
    HighHash { hash: Hash256 },

    /// Compact target is negative, overflows, or exceeds the network limit.
    #[error("Invalid difficulty bits: {bits:#010x}")]
    BadDiffBits { bits: u32 },

    /// Merkle root in the header does not match the transactions.
    #[error("Merkle root mismatch")]
    BadMerkleRoot,

    /// The same transaction appears twice.
    #[error("Duplicate transaction {txid}")]
    DuplicateTransaction { txid: Hash256 },

    /// Block is empty or too large.
    #[error("Bad block length: {size} bytes, max {max}")]
    BadBlockLength { size: usize, max: usize },

    /// First transaction is not a coinbase.
    #[error("First transaction is not a coinbase")]
    MissingCoinbase,

    /// More than one coinbase.
    #[error("More than one coinbase")]
    MultipleCoinbase,

    /// Coinbase script length outside bounds.
    #[error("Coinbase script length {0} out of range")]
    BadCoinbaseLength(usize),

    /// Transaction has no inputs.
    #[error("Transaction {txid} has no inputs")]
    EmptyInputs { txid: Hash256 },

    /// Transaction has no outputs.
    #[error("Transaction {txid} has no outputs")]
    EmptyOutputs { txid: Hash256 },

    /// Output value is negative.
    #[error("Negative output value in {txid}")]
    NegativeOutput { txid: Hash256 },

    /// Output value above the money supply.
    #[error("Output value too large in {txid}")]
    OutputTooLarge { txid: Hash256 },

    /// Sum of outputs above the money supply.
    #[error("Output total too large in {txid}")]
    OutputTotalTooLarge { txid: Hash256 },

    /// Same outpoint spent twice in one transaction.
    #[error("Duplicate input {outpoint} in {txid}")]
    DuplicateInputs { txid: Hash256, outpoint: OutPoint },

    /// Non-coinbase input references the null outpoint.
    #[error("Null prevout in {txid}")]
    NullPrevout { txid: Hash256 },

    /// Input does not exist or was already spent.
    #[error("Input {outpoint} missing or spent")]
    MissingOrSpent { outpoint: OutPoint },

    /// Coinbase output spent before maturity.
    #[error("Premature spend of coinbase {outpoint}: depth {depth}")]
    PrematureCoinbaseSpend { outpoint: OutPoint, depth: i32 },

    /// Input values out of range.
    #[error("Input values out of range in {txid}")]
    InputValuesOutOfRange { txid: Hash256 },

    /// Outputs exceed inputs.
    #[error("Inputs {inputs} below outputs {outputs} in {txid}")]
    InBelowOut {
        txid: Hash256,
        inputs: Amount,
        outputs: Amount,
    },

    /// Accumulated fees out of range.
    #[error("Fee out of range")]
    FeeOutOfRange,

    /// Coinbase pays more than subsidy plus fees.
    #[error("Coinbase pays too much: actual {actual}, limit {limit}")]
    BadCoinbaseAmount { actual: Amount, limit: Amount },

    /// Block would overwrite an unspent output.
    #[error("Transaction {txid} overwrites an unspent output")]
    Bip30 { txid: Hash256 },

    /// Script check failed.
    #[error("Script verification failed for {txid}: {reason}")]
    ScriptFailure { txid: Hash256, reason: String },

    /// Parent header is not known.
    #[error("Unknown parent block {0}")]
    UnknownParent(Hash256),

    /// Block descends from a block known to be invalid.
    #[error("Parent block {0} is invalid")]
    BadPrevBlock(Hash256),

    /// Block was already found invalid.
    #[error("Block {0} is already known to be invalid")]
    KnownInvalid(Hash256),
}

impl ConsensusError {
    /// Short machine-readable rejection reason.
    pub fn reject_reason(&self) -> &'static str {
        match self {
            ConsensusError::Decode(_) => "bad-encoding",
            ConsensusError::HighHash { .. } => "high-hash",
            ConsensusError::BadDiffBits { .. } => "bad-diffbits",
            ConsensusError::BadMerkleRoot => "bad-txnmrklroot",
            ConsensusError::DuplicateTransaction { .. } => "bad-txns-duplicate",
            ConsensusError::BadBlockLength { .. } => "bad-blk-length",
            ConsensusError::MissingCoinbase => "bad-cb-missing",
            ConsensusError::MultipleCoinbase => "bad-cb-multiple",
            ConsensusError::BadCoinbaseLength(_) => "bad-cb-length",
            ConsensusError::EmptyInputs { .. } => "bad-txns-vin-empty",
            ConsensusError::EmptyOutputs { .. } => "bad-txns-vout-empty",
            ConsensusError::NegativeOutput { .. } => "bad-txns-vout-negative",
            ConsensusError::OutputTooLarge { .. } => "bad-txns-vout-toolarge",
            ConsensusError::OutputTotalTooLarge { .. } => "bad-txns-txouttotal-toolarge",
            ConsensusError::DuplicateInputs { .. } => "bad-txns-inputs-duplicate",
            ConsensusError::NullPrevout { .. } => "bad-txns-prevout-null",
            ConsensusError::MissingOrSpent { .. } => "bad-txns-inputs-missingorspent",
            ConsensusError::PrematureCoinbaseSpend { .. } => "bad-txns-premature-spend-of-coinbase",
            ConsensusError::InputValuesOutOfRange { .. } => "bad-txns-inputvalues-outofrange",
            ConsensusError::InBelowOut { .. } => "bad-txns-in-belowout",
            ConsensusError::FeeOutOfRange => "bad-txns-fee-outofrange",
            ConsensusError::BadCoinbaseAmount { .. } => "bad-cb-amount",
            ConsensusError::Bip30 { .. } => "bad-txns-BIP30",
            ConsensusError::ScriptFailure { .. } => "mandatory-script-verify-flag-failed",
            ConsensusError::UnknownParent(_) => "prev-blk-not-found",
            ConsensusError::BadPrevBlock(_) => "bad-prevblk",
            ConsensusError::KnownInvalid(_) => "duplicate-invalid",
        }
    }

    /// Whether the block body may have been mutated in transit while the
    /// header is still valid. Such failures must not mark the header failed.
    pub fn may_be_mutated(&self) -> bool {
        matches!(
            self,
            ConsensusError::BadMerkleRoot | ConsensusError::DuplicateTransaction { .. }
        )
    }

    /// Peer-banning weight, 0-100.
    pub fn ban_score(&self) -> u32 {
        match self {
            ConsensusError::HighHash { .. } => 50,
            ConsensusError::EmptyInputs { .. }
            | ConsensusError::EmptyOutputs { .. }
            | ConsensusError::NullPrevout { .. }
            | ConsensusError::UnknownParent(_) => 10,
            ConsensusError::PrematureCoinbaseSpend { .. } | ConsensusError::KnownInvalid(_) => 0,
            _ => 100,
        }
    }
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;
