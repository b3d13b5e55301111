//! Error types for chain state management.

use ferrite_consensus::{ConsensusError, Hash256};
use thiserror::Error;

/// System-level failures.
///
/// Any of these observed during a mutating operation puts the chain manager
/// into its aborted state.
#[derive(Error, Debug)]
pub enum StateError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] ferrite_storage::StorageError),

    /// Stored data failed to decode.
    #[error("Consensus decode error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Persisted state is unreadable or self-contradictory.
    #[error("Corrupted chain state: {0}")]
    Corruption(String),

    /// In-memory state disagrees with itself.
    #[error("Inconsistent chain state: {0}")]
    Inconsistent(String),

    /// No descriptor for the given hash.
    #[error("Unknown block: {0}")]
    UnknownBlock(Hash256),

    /// The block's data is not on disk.
    #[error("Block data missing: {0}")]
    MissingBlockData(Hash256),

    /// A released read view found the UTXO set moved on.
    #[error("Best block changed from {expected} to {actual}")]
    BestBlockChanged { expected: Hash256, actual: Hash256 },

    /// An earlier system error halted block processing.
    #[error("Chain state aborted after a previous failure; restart required")]
    Aborted,

    /// Script worker pool could not be built.
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operator command that cannot apply to the given block.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StateError {
    /// Whether this error must halt block processing. Lookups of unknown
    /// blocks, stale read views, bad configuration and refused operator
    /// commands are caller errors.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StateError::UnknownBlock(_)
                | StateError::BestBlockChanged { .. }
                | StateError::Config(_)
                | StateError::InvalidRequest(_)
                | StateError::Aborted
        )
    }
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// A block that broke a consensus rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRejection {
    pub hash: Hash256,
    pub error: ConsensusError,
}

impl BlockRejection {
    pub fn new(hash: Hash256, error: ConsensusError) -> Self {
        Self { hash, error }
    }

    /// Short machine-readable reason.
    pub fn reason(&self) -> &'static str {
        self.error.reject_reason()
    }

    /// Peer-banning weight.
    pub fn ban_score(&self) -> u32 {
        self.error.ban_score()
    }
}

impl std::fmt::Display for BlockRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {} rejected ({}): {}", self.hash, self.reason(), self.error)
    }
}

/// Error surface of the public chain operations.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Consensus-invalid; never fatal.
    #[error("{0}")]
    Rejected(BlockRejection),

    /// System failure; block processing has been halted.
    #[error("System error: {0}")]
    System(#[from] StateError),
}

impl ChainError {
    pub fn rejection(&self) -> Option<&BlockRejection> {
        match self {
            ChainError::Rejected(rejection) => Some(rejection),
            ChainError::System(_) => None,
        }
    }
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// How an activation ended when it did not fail.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateOutcome {
    /// No better eligible tip remains.
    Completed,
    /// The caller's token fired.
    Cancelled,
}
