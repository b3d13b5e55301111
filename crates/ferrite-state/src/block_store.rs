//! Block and undo byte storage.

use crate::coins::BlockUndo;
use crate::{StateError, StateResult};
use ferrite_consensus::encoding::{deserialize, serialize};
use ferrite_consensus::Block;
use ferrite_storage::{FilePos, FlatFileKind, FlatFileStore, StorageError};
use parking_lot::Mutex;
use std::path::Path;

/// Append-oriented store for serialized blocks and undo records.
pub trait BlockFiles: Send + Sync {
    fn write_block(&self, bytes: &[u8]) -> StateResult<FilePos>;
    fn read_block(&self, pos: FilePos) -> StateResult<Vec<u8>>;
    fn write_undo(&self, bytes: &[u8]) -> StateResult<FilePos>;
    fn read_undo(&self, pos: FilePos) -> StateResult<Vec<u8>>;
    /// Make every write so far durable.
    fn sync(&self) -> StateResult<()>;
}

/// Load and decode a block.
pub fn load_block(files: &dyn BlockFiles, pos: FilePos) -> StateResult<Block> {
    let bytes = files.read_block(pos)?;
    deserialize(&bytes)
        .map_err(|e| StateError::Corruption(format!("block at {:?}: {}", pos, e)))
}

/// Load and decode an undo record.
pub fn load_undo(files: &dyn BlockFiles, pos: FilePos) -> StateResult<BlockUndo> {
    let bytes = files.read_undo(pos)?;
    deserialize(&bytes)
        .map_err(|e| StateError::Corruption(format!("undo at {:?}: {}", pos, e)))
}

/// Encode and store an undo record.
pub fn store_undo(files: &dyn BlockFiles, undo: &BlockUndo) -> StateResult<FilePos> {
    files.write_undo(&serialize(undo))
}

/// `blk#####.dat` / `rev#####.dat` files in one directory.
pub struct FlatBlockFiles {
    blocks: FlatFileStore,
    undo: FlatFileStore,
}

impl FlatBlockFiles {
    pub fn open<P: AsRef<Path>>(dir: P, max_file_size: u64) -> StateResult<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            blocks: FlatFileStore::open(dir, FlatFileKind::Blocks, max_file_size)?,
            undo: FlatFileStore::open(dir, FlatFileKind::Undo, max_file_size)?,
        })
    }
}

impl BlockFiles for FlatBlockFiles {
    fn write_block(&self, bytes: &[u8]) -> StateResult<FilePos> {
        Ok(self.blocks.append(bytes)?)
    }

    fn read_block(&self, pos: FilePos) -> StateResult<Vec<u8>> {
        Ok(self.blocks.read(pos)?)
    }

    fn write_undo(&self, bytes: &[u8]) -> StateResult<FilePos> {
        Ok(self.undo.append(bytes)?)
    }

    fn read_undo(&self, pos: FilePos) -> StateResult<Vec<u8>> {
        Ok(self.undo.read(pos)?)
    }

    fn sync(&self) -> StateResult<()> {
        self.blocks.sync()?;
        self.undo.sync()?;
        Ok(())
    }
}

/// In-memory block files, for tests.
#[derive(Default)]
pub struct MemoryBlockFiles {
    blocks: Mutex<Vec<Vec<u8>>>,
    undo: Mutex<Vec<Vec<u8>>>,
}

impl MemoryBlockFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(records: &Mutex<Vec<Vec<u8>>>, bytes: &[u8]) -> FilePos {
        let mut records = records.lock();
        records.push(bytes.to_vec());
        FilePos {
            file: 0,
            offset: (records.len() - 1) as u32,
        }
    }

    fn read(records: &Mutex<Vec<Vec<u8>>>, pos: FilePos) -> StateResult<Vec<u8>> {
        records
            .lock()
            .get(pos.offset as usize)
            .cloned()
            .ok_or_else(|| {
                StorageError::InvalidPosition {
                    file: pos.file,
                    offset: pos.offset,
                }
                .into()
            })
    }
}

impl BlockFiles for MemoryBlockFiles {
    fn write_block(&self, bytes: &[u8]) -> StateResult<FilePos> {
        Ok(Self::append(&self.blocks, bytes))
    }

    fn read_block(&self, pos: FilePos) -> StateResult<Vec<u8>> {
        Self::read(&self.blocks, pos)
    }

    fn write_undo(&self, bytes: &[u8]) -> StateResult<FilePos> {
        Ok(Self::append(&self.undo, bytes))
    }

    fn read_undo(&self, pos: FilePos) -> StateResult<Vec<u8>> {
        Self::read(&self.undo, pos)
    }

    fn sync(&self) -> StateResult<()> {
        Ok(())
    }
}
