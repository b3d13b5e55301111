//! Append-only flat files for raw block and undo bytes.
//!
//! Records are laid out as `magic (4) | length (4, LE) | payload`. A new file
//! is started once the current one would grow past the configured size.
//! Callers only ever see [`FilePos`] handles.

use crate::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default maximum size of a single flat file (128 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;

const RECORD_MAGIC: [u8; 4] = *b"FRTE";
const RECORD_HEADER_LEN: u64 = 8;

/// Which family of flat files a store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatFileKind {
    /// Serialized blocks (`blk#####.dat`).
    Blocks,
    /// Serialized undo data (`rev#####.dat`).
    Undo,
}

impl FlatFileKind {
    fn prefix(&self) -> &'static str {
        match self {
            FlatFileKind::Blocks => "blk",
            FlatFileKind::Undo => "rev",
        }
    }
}

/// Position of a record inside a flat file family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilePos {
    /// File number.
    pub file: u32,
    /// Byte offset of the record header inside the file.
    pub offset: u32,
}

impl FilePos {
    /// Encoded length in bytes.
    pub const ENCODED_LEN: usize = 8;

    /// Encode as `file (4, LE) | offset (4, LE)`.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.file.to_le_bytes());
        out[4..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decode from the layout produced by [`FilePos::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let file = u32::from_le_bytes(bytes[..4].try_into().ok()?);
        let offset = u32::from_le_bytes(bytes[4..].try_into().ok()?);
        Some(Self { file, offset })
    }
}

#[derive(Debug)]
struct Cursor {
    file: u32,
    len: u64,
}

/// A directory of numbered append-only files.
pub struct FlatFileStore {
    dir: PathBuf,
    kind: FlatFileKind,
    max_file_size: u64,
    cursor: Mutex<Cursor>,
}

impl FlatFileStore {
    /// Open (creating if needed) the flat files of `kind` under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, kind: FlatFileKind, max_file_size: u64) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut last_file = 0u32;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(number) = name
                .strip_prefix(kind.prefix())
                .and_then(|rest| rest.strip_suffix(".dat"))
                .and_then(|digits| digits.parse::<u32>().ok())
            {
                last_file = last_file.max(number);
            }
        }

        let path = Self::path_for(&dir, kind, last_file);
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        info!(?dir, ?kind, last_file, len, "Flat file store opened");

        Ok(Self {
            dir,
            kind,
            max_file_size,
            cursor: Mutex::new(Cursor {
                file: last_file,
                len,
            }),
        })
    }

    fn path_for(dir: &Path, kind: FlatFileKind, file: u32) -> PathBuf {
        dir.join(format!("{}{:05}.dat", kind.prefix(), file))
    }

    /// Append a record and return its position.
    pub fn append(&self, payload: &[u8]) -> StorageResult<FilePos> {
        let record_len = RECORD_HEADER_LEN + payload.len() as u64;
        let mut cursor = self.cursor.lock();

        if cursor.len > 0 && cursor.len + record_len > self.max_file_size {
            cursor.file += 1;
            cursor.len = 0;
            debug!(kind = ?self.kind, file = cursor.file, "Starting new flat file");
        }

        let offset = u32::try_from(cursor.len).map_err(|_| StorageError::InvalidPosition {
            file: cursor.file,
            offset: u32::MAX,
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path_for(&self.dir, self.kind, cursor.file))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Corruption("flat file record too large".into()))?;
        let mut record = Vec::with_capacity(record_len as usize);
        record.extend_from_slice(&RECORD_MAGIC);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(payload);
        file.write_all(&record)?;

        let pos = FilePos {
            file: cursor.file,
            offset,
        };
        cursor.len += record_len;
        Ok(pos)
    }

    /// Read the record at `pos`.
    pub fn read(&self, pos: FilePos) -> StorageResult<Vec<u8>> {
        let invalid = || StorageError::InvalidPosition {
            file: pos.file,
            offset: pos.offset,
        };

        let mut file = File::open(Self::path_for(&self.dir, self.kind, pos.file)).map_err(|_| invalid())?;
        file.seek(SeekFrom::Start(pos.offset as u64))?;

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header).map_err(|_| invalid())?;
        if header[..4] != RECORD_MAGIC {
            return Err(invalid());
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)
            .map_err(|_| StorageError::Corruption(format!("truncated record at {:?}", pos)))?;
        Ok(payload)
    }

    /// Fsync the file currently being appended to.
    pub fn sync(&self) -> StorageResult<()> {
        let cursor = self.cursor.lock();
        let path = Self::path_for(&self.dir, self.kind, cursor.file);
        if path.exists() {
            File::open(path)?.sync_all()?;
        }
        Ok(())
    }
}
