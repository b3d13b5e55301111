//! Test harness for integration tests.
//!
//! Provides a chain manager over on-disk storage in a temporary directory,
//! with a real mempool attached, that can be reopened to test recovery.

use crate::generators::regtest_params;
use ferrite_consensus::{
    AcceptAllScripts, Block, ChainParams, FrozenOutputs, Hash256, NoFrozenOutputs, OutPoint,
    ScriptChecker,
};
use ferrite_mempool::Mempool;
use ferrite_state::{
    ActivateOutcome, ChainConfig, ChainManager, ChainResult, Coin, Collaborators, FlatBlockFiles,
};
use ferrite_storage::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Chain manager and mempool over a temporary data directory.
pub struct TestChain {
    pub manager: ChainManager,
    pub mempool: Arc<Mempool>,
    params: ChainParams,
    config: ChainConfig,
    scripts: Arc<dyn ScriptChecker>,
    frozen: Arc<dyn FrozenOutputs>,
    dir: TempDir,
}

impl TestChain {
    /// Create a chain on regtest parameters with default configuration.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ChainConfig) -> Self {
        Self::with_collaborators(config, Arc::new(AcceptAllScripts), Arc::new(NoFrozenOutputs))
    }

    /// Create a chain with the given script checker and frozen-output source.
    pub fn with_collaborators(
        config: ChainConfig,
        scripts: Arc<dyn ScriptChecker>,
        frozen: Arc<dyn FrozenOutputs>,
    ) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let params = regtest_params();
        let mempool = Arc::new(Mempool::with_defaults());
        let manager = open_manager(&dir, &params, &config, &scripts, &frozen, &mempool);
        Self {
            manager,
            mempool,
            params,
            config,
            scripts,
            frozen,
            dir,
        }
    }

    /// Shut down cleanly and open the same directory again.
    pub fn reopen(self) -> Self {
        self.manager.shutdown().expect("Failed to shut down");
        self.reopen_after_crash()
    }

    /// Drop the manager without the final flush and open the same
    /// directory again.
    pub fn reopen_after_crash(self) -> Self {
        let Self {
            manager,
            mempool,
            params,
            config,
            scripts,
            frozen,
            dir,
        } = self;
        drop(manager);
        let manager = open_manager(&dir, &params, &config, &scripts, &frozen, &mempool);
        Self {
            manager,
            mempool,
            params,
            config,
            scripts,
            frozen,
            dir,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Process a block that is expected to be accepted.
    pub fn process(&self, block: &Block) -> ActivateOutcome {
        self.try_process(block).expect("Block was refused")
    }

    pub fn try_process(&self, block: &Block) -> ChainResult<ActivateOutcome> {
        self.manager.process_block(block, &CancellationToken::new())
    }

    pub fn process_all(&self, blocks: &[Block]) {
        for block in blocks {
            self.process(block);
        }
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.manager.tip().expect("Chain has no tip").hash()
    }

    pub fn height(&self) -> i32 {
        self.manager.height()
    }

    /// Coin at `outpoint` as seen by a fresh read view.
    pub fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.manager
            .utxo()
            .read_view()
            .get(outpoint)
            .expect("UTXO read failed")
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with a small script pool.
pub fn test_config() -> ChainConfig {
    ChainConfig {
        script_threads: 2,
        ..ChainConfig::default()
    }
}

fn open_manager(
    dir: &TempDir,
    params: &ChainParams,
    config: &ChainConfig,
    scripts: &Arc<dyn ScriptChecker>,
    frozen: &Arc<dyn FrozenOutputs>,
    mempool: &Arc<Mempool>,
) -> ChainManager {
    let storage = Arc::new(Database::open(dir.path().join("db")).expect("Failed to open database"));
    let block_files = Arc::new(
        FlatBlockFiles::open(dir.path().join("blocks"), config.block_file_size)
            .expect("Failed to open block files"),
    );
    let collaborators = Collaborators {
        scripts: Arc::clone(scripts),
        frozen: Arc::clone(frozen),
        mempool: Arc::clone(mempool) as Arc<dyn ferrite_state::MempoolSink>,
    };
    ChainManager::open(
        params.clone(),
        config.clone(),
        storage,
        block_files,
        collaborators,
    )
    .expect("Failed to open chain manager")
}
