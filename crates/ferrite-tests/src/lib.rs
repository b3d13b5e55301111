//! Integration tests for the ferrite chainstate engine.
//!
//! This crate contains tests that exercise the chain manager, UTXO set,
//! policy windows and mempool together, over on-disk storage.

pub mod generators;
pub mod harness;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod mempool_tests;
#[cfg(test)]
mod persistence_tests;
#[cfg(test)]
mod property_tests;

pub use generators::*;
pub use harness::*;
