//! # ferrite-state
//!
//! Chainstate for the ferrite engine.
//!
//! This crate provides:
//! - The block tree of every known header, with skip-list ancestor lookup
//! - The active chain and best-chain selection
//! - The cached UTXO set with read views, spans and flush coordination
//! - Reorganization: disconnecting to a fork and connecting forward, with
//!   script checks optionally run outside the main lock
//! - Soft rejection and soft consensus freezes
//! - Block index persistence and recovery
//!
//! ## Architecture
//!
//! - `BlockTree`: owns every `BlockDescriptor`, addressed by `BlockHandle`
//! - `ChainSelector`: the ordered set of candidate tips
//! - `UtxoSet`: the coin cache over the `Coins` column family
//! - `ChainManager`: takes the main lock and drives all of the above
//!
//! Locks are always taken in the order main lock, then UTXO lock.

mod block_store;
mod chain;
mod coins;
mod config;
mod descriptor;
mod error;
mod manager;
mod mempool;
mod operator;
mod persistence;
mod policy;
mod reorg;
mod selector;
mod tree;
mod utxo;

#[cfg(test)]
mod test_blocks;

pub use block_store::{load_block, load_undo, store_undo, BlockFiles, FlatBlockFiles, MemoryBlockFiles};
pub use chain::Chain;
pub use coins::{BlockUndo, Coin, TxUndo};
pub use config::ChainConfig;
pub use descriptor::{BlockDescriptor, BlockHandle, BlockValidity, ValidationTime, LOCK_POOL_SIZE};
pub use error::{ActivateOutcome, BlockRejection, ChainError, ChainResult, StateError, StateResult};
pub use manager::{ChainInfo, ChainManager, Collaborators, FlushMode};
pub use mempool::{MempoolSink, NullMempool};
pub use policy::{apply_soft_consensus_freeze, recompute_soft_rejection, set_soft_rejection};
pub use selector::{compare_tips, CandidateKey, ChainSelector};
pub use tree::{BlockTree, InsertOutcome};
pub use utxo::{FlushStats, Reattach, TryFlush, UtxoReadView, UtxoSet, UtxoSpan, BEST_BLOCK_KEY};
