//! # ferrite-consensus
//!
//! Consensus types and rules for the ferrite chainstate engine.
//!
//! This crate provides:
//! - Primitive chain types (hashes, headers, transactions, blocks)
//! - The wire encoding used for hashing and persistence
//! - Proof-of-work and chain-work arithmetic
//! - Structural block checks and the subsidy schedule
//! - Network parameters
//! - The script-checking and frozen-output collaborator contracts
//!
//! ## Chain Work
//!
//! Each block contributes `2^256 / (target + 1)` to the cumulative work of
//! every chain that contains it. Work is carried as a [`num_bigint::BigUint`].

mod block;
mod chain_params;
pub mod encoding;
mod error;
mod hash;
mod pow;
mod script;
mod transaction;
mod validation;

pub use block::{Block, BlockHeader};
pub use chain_params::{Bip30Exception, ChainParams, Network};
pub use error::{ConsensusError, ConsensusResult};
pub use hash::{sha256d, Hash256};
pub use pow::{block_proof, check_proof_of_work, compact_to_target, target_to_compact};
pub use script::{
    AcceptAllScripts, FrozenOutputs, NoFrozenOutputs, ScriptCheckResult, ScriptChecker,
    ScriptFlags,
};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
pub use validation::{
    block_subsidy, check_block, check_transaction, merkle_root, money_range,
};

/// Amounts are signed so that range checks can detect underflow.
pub type Amount = i64;

/// Network-independent protocol constants.
pub mod params {
    use super::Amount;

    /// Smallest units per coin.
    pub const COIN: Amount = 100_000_000;

    /// Upper bound on any amount (21 million coins).
    pub const MAX_MONEY: Amount = 21_000_000 * COIN;

    /// Subsidy of the first halving era.
    pub const INITIAL_SUBSIDY: Amount = 50 * COIN;

    /// Number of halvings after which the subsidy is zero.
    pub const MAX_HALVINGS: u32 = 64;

    /// Minimum coinbase script length in bytes.
    pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;

    /// Maximum coinbase script length in bytes.
    pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

    /// Serialized header length.
    pub const HEADER_SIZE: usize = 80;

    /// Output script prefix marking a confiscation transaction:
    /// `OP_FALSE OP_RETURN PUSH4 "cftx"`.
    pub const CONFISCATION_MARKER: &[u8] = &[0x00, 0x6a, 0x04, b'c', b'f', b't', b'x'];
}
