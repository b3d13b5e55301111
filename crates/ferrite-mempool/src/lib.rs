//! # ferrite-mempool
//!
//! Transaction pool for the ferrite chainstate engine.
//!
//! This crate provides:
//! - Transaction storage with an input spend index
//! - Admission against a UTXO read view, uncaching coins loaded only for
//!   a failed attempt
//! - Double-spend detection
//! - Size limits with fee-rate based eviction
//! - The reconciliation hooks the chain manager drives during a
//!   reorganization

mod error;
mod ordering;
mod pool;

pub use error::{MempoolError, MempoolResult};
pub use ordering::PoolOrder;
pub use pool::{Mempool, MempoolConfig, MempoolStats, PooledTransaction};

/// Default maximum mempool size in bytes.
pub const DEFAULT_MAX_BYTES: usize = 300 * 1024 * 1024;

/// Default maximum number of transactions.
pub const DEFAULT_MAX_TXS: usize = 100_000;
