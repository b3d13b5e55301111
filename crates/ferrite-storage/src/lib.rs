//! # ferrite-storage
//!
//! Storage layer for the ferrite chainstate engine.
//!
//! This crate provides:
//! - A RocksDB-backed key-value store with column families
//! - Atomic batch writes
//! - An in-memory store with the same contract, used by tests
//! - Append-only flat files for raw block and undo bytes
//!
//! ## Column Families
//!
//! - `BlockIndex`: Block descriptor records indexed by block hash
//! - `Coins`: Unspent outputs indexed by outpoint
//! - `Metadata`: Best block pointer, flat-file cursors and other node metadata

mod batch;
mod database;
mod error;
mod flatfile;
mod memory;

pub use batch::{BatchOp, WriteBatch};
pub use database::{ColumnFamily, Database};
pub use error::{StorageError, StorageResult};
pub use flatfile::{FilePos, FlatFileKind, FlatFileStore, DEFAULT_MAX_FILE_SIZE};
pub use memory::MemoryStorage;

/// Storage trait for abstracting database operations.
///
/// This allows for easy testing with mock implementations.
pub trait Storage: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Delete a key from a column family.
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()>;

    /// Check if a key exists in a column family.
    fn contains(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Execute a batch of writes atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Create an iterator over a column family, in key order.
    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;

    /// Get multiple values by keys from a column family.
    fn multi_get(&self, cf: ColumnFamily, keys: &[&[u8]]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(cf, k)).collect()
    }
}
