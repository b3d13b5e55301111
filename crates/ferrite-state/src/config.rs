//! Chain state configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the chain manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Loaded UTXO entries retained before script-less loads stop being
    /// cached.
    pub cache_max_entries: usize,
    /// Cache memory that forces a flush, in bytes.
    pub cache_budget_bytes: usize,
    /// Seconds between periodic flushes.
    pub flush_interval_secs: u64,
    /// Script-check worker threads; 0 means one per CPU.
    pub script_threads: usize,
    /// Release the main lock while scripts are checked.
    pub parallel_validation: bool,
    /// Freeze window applied when a block spends a frozen output.
    pub soft_freeze_duration: i32,
    /// Lost races tolerated before each further retry is logged as a
    /// warning.
    pub max_race_retries: u32,
    /// Maximum size of one block or undo file.
    pub block_file_size: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: 1_000_000,
            cache_budget_bytes: 450 * 1024 * 1024,
            flush_interval_secs: 3600,
            script_threads: 0,
            parallel_validation: true,
            soft_freeze_duration: 3,
            max_race_retries: 8,
            block_file_size: ferrite_storage::DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl ChainConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}
