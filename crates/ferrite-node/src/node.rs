//! Node implementation.

use crate::config::NodeConfig;
use anyhow::{bail, Context, Result};
use ferrite_consensus::encoding::deserialize;
use ferrite_consensus::{Block, ChainParams};
use ferrite_mempool::Mempool;
use ferrite_state::{
    ActivateOutcome, ChainError, ChainInfo, ChainManager, ChainResult, Collaborators,
    FlatBlockFiles, FlushMode,
};
use ferrite_storage::Database;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between status lines while running.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Counters reported by a block import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub processed: usize,
    pub rejected: usize,
    pub cancelled: bool,
}

/// The node: chainstate plus mempool, driven from the async runtime.
pub struct Node {
    config: NodeConfig,
    chain: Arc<ChainManager>,
    mempool: Arc<Mempool>,
    shutdown: CancellationToken,
}

impl Node {
    /// Open the database, block files and chainstate under the data
    /// directory.
    pub async fn open(config: NodeConfig) -> Result<Arc<Self>> {
        let params = ChainParams::for_network(config.network_kind()?);
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {:?}", config.data_dir)
        })?;

        let mempool = Arc::new(Mempool::new(config.mempool.clone()));

        let data_dir = config.data_dir.clone();
        let chain_config = config.chain.clone();
        let sink = Arc::clone(&mempool);
        let chain = tokio::task::spawn_blocking(move || -> Result<ChainManager> {
            let db_path = data_dir.join("db");
            info!("Opening database at {:?}", db_path);
            let storage = Arc::new(Database::open(&db_path).context("Failed to open database")?);
            let block_files = Arc::new(
                FlatBlockFiles::open(data_dir.join("blocks"), chain_config.block_file_size)
                    .context("Failed to open block files")?,
            );
            let collaborators = Collaborators {
                mempool: sink,
                ..Default::default()
            };
            ChainManager::open(params, chain_config, storage, block_files, collaborators)
                .context("Failed to open chainstate")
        })
        .await??;

        Ok(Arc::new(Self {
            config,
            chain: Arc::new(chain),
            mempool,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    /// Run a chain operation on the blocking pool.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ChainManager) -> ChainResult<T> + Send + 'static,
    {
        let chain = Arc::clone(&self.chain);
        Ok(tokio::task::spawn_blocking(move || op(&*chain)).await??)
    }

    /// Run until shutdown is requested, flushing periodically.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!("Starting node services...");
        let outcome = self
            .blocking(|chain| chain.activate_best_chain(&CancellationToken::new()))
            .await?;
        debug!(?outcome, "Initial activation finished");

        let mut flush_interval = tokio::time::interval(self.config.chain.flush_interval());
        flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        flush_interval.tick().await;
        let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
        status_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = flush_interval.tick() => {
                    if let Err(e) = self.blocking(|chain| chain.flush(FlushMode::Periodic)).await {
                        error!("Periodic flush failed: {:#}", e);
                        if self.chain.is_aborted() {
                            self.request_shutdown();
                        }
                    }
                }
                _ = status_interval.tick() => self.log_status(),
            }
        }

        info!("Node main loop stopped");
        Ok(())
    }

    /// Import length-prefixed blocks from `path`.
    pub async fn import(&self, path: &Path) -> Result<ImportStats> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let chain = Arc::clone(&self.chain);
        let cancel = self.shutdown.child_token();
        tokio::task::spawn_blocking(move || import_blocks(&chain, &bytes, &cancel)).await?
    }

    pub fn info(&self) -> ChainInfo {
        self.chain.info()
    }

    fn log_status(&self) {
        let info = self.chain.info();
        let mempool = self.mempool.stats();
        info!(
            height = info.height,
            tip = ?info.tip,
            candidates = info.candidates,
            utxo_cache_entries = info.utxo_cache_entries,
            utxo_memory = info.utxo_memory,
            mempool_txs = mempool.tx_count,
            "Node status"
        );
    }

    /// Ask the run loop and any import to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop everything and flush the chainstate to disk.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down node...");
        self.request_shutdown();
        if self.chain.is_aborted() {
            warn!("Chainstate was aborted, skipping the final flush");
            return Ok(());
        }
        self.blocking(|chain| chain.shutdown())
            .await
            .context("Final flush failed")?;
        info!("Node shutdown complete");
        Ok(())
    }
}

/// Process every `<u32 LE length><block>` record of `bytes` in order.
/// Rejected blocks are counted and skipped; system errors stop the import.
pub fn import_blocks(
    chain: &ChainManager,
    bytes: &[u8],
    cancel: &CancellationToken,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let Some(len_bytes) = bytes.get(offset..offset + 4) else {
            bail!("Truncated record header at offset {}", offset);
        };
        let mut len = [0u8; 4];
        len.copy_from_slice(len_bytes);
        let len = u32::from_le_bytes(len) as usize;
        let start = offset + 4;
        let Some(record) = bytes.get(start..start + len) else {
            bail!("Truncated block record at offset {}", offset);
        };
        let block: Block = deserialize(record)
            .with_context(|| format!("Malformed block record at offset {}", offset))?;
        offset = start + len;

        match chain.process_block(&block, cancel) {
            Ok(ActivateOutcome::Completed) => stats.processed += 1,
            Ok(ActivateOutcome::Cancelled) => {
                info!(processed = stats.processed, "Import cancelled");
                stats.cancelled = true;
                break;
            }
            Err(ChainError::Rejected(_)) => stats.rejected += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("Import stopped at block {}", block.hash()))
            }
        }
    }
    info!(
        processed = stats.processed,
        rejected = stats.rejected,
        height = chain.height(),
        "Import finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_consensus::encoding::serialize;
    use ferrite_consensus::{
        block_subsidy, check_proof_of_work, merkle_root, BlockHeader, Hash256, OutPoint,
        Transaction, TxIn, TxOut,
    };

    fn regtest_config(dir: &Path) -> NodeConfig {
        let mut config = NodeConfig::default_for_network("regtest");
        config.data_dir = dir.to_path_buf();
        config.chain.script_threads = 2;
        config
    }

    fn mine_chain(params: &ChainParams, count: i32) -> Vec<Block> {
        let mut prev = params.genesis_hash();
        (1..=count)
            .map(|height| {
                let coinbase = Transaction {
                    version: 1,
                    inputs: vec![TxIn::new(OutPoint::null(), height.to_le_bytes().to_vec())],
                    outputs: vec![TxOut::new(block_subsidy(height, params), vec![0x51])],
                    lock_time: 0,
                };
                let txs = vec![coinbase];
                let mut header = BlockHeader {
                    version: 1,
                    prev_hash: prev,
                    merkle_root: merkle_root(&txs),
                    time: 1_700_000_000 + height as u32,
                    bits: params.pow_limit_bits,
                    nonce: 0,
                };
                while check_proof_of_work(&header, params).is_err() {
                    header.nonce += 1;
                }
                let block = Block::new(header, txs);
                prev = block.hash();
                block
            })
            .collect()
    }

    fn encode(blocks: &[Block]) -> Vec<u8> {
        let mut out = Vec::new();
        for block in blocks {
            let bytes = serialize(block);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }

    #[tokio::test]
    async fn test_import_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let blocks = mine_chain(&params, 5);
        let file = dir.path().join("blocks.bin");
        std::fs::write(&file, encode(&blocks)).unwrap();

        {
            let node = Node::open(regtest_config(&dir.path().join("data"))).await.unwrap();
            let stats = node.import(&file).await.unwrap();
            assert_eq!(stats.processed, 5);
            assert_eq!(stats.rejected, 0);
            assert_eq!(node.info().height, 5);
            node.shutdown().await.unwrap();
        }

        let node = Node::open(regtest_config(&dir.path().join("data"))).await.unwrap();
        assert_eq!(node.info().height, 5);
        assert_eq!(node.info().tip, Some(blocks[4].hash()));
    }

    #[tokio::test]
    async fn test_operator_commands_through_node() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let blocks = mine_chain(&params, 3);
        let file = dir.path().join("blocks.bin");
        std::fs::write(&file, encode(&blocks)).unwrap();

        let node = Node::open(regtest_config(dir.path())).await.unwrap();
        node.import(&file).await.unwrap();

        let target = blocks[1].hash();
        node.blocking(move |chain| chain.invalidate_block(&target)).await.unwrap();
        assert_eq!(node.info().height, 1);
        node.blocking(move |chain| chain.reconsider_block(&target)).await.unwrap();
        assert_eq!(node.info().height, 3);

        let unknown = Hash256([7; 32]);
        assert!(node
            .blocking(move |chain| chain.prioritize_block(&unknown))
            .await
            .is_err());
        node.shutdown().await.unwrap();
    }

    #[test]
    fn test_truncated_import_is_an_error() {
        let params = ChainParams::regtest();
        let chain = ChainManager::open(
            params.clone(),
            ferrite_state::ChainConfig::default(),
            Arc::new(ferrite_storage::MemoryStorage::new()),
            Arc::new(ferrite_state::MemoryBlockFiles::new()),
            Collaborators::default(),
        )
        .unwrap();
        let mut bytes = encode(&mine_chain(&params, 2));
        bytes.truncate(bytes.len() - 3);

        let err = import_blocks(&chain, &bytes, &CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("Truncated block record"));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_import_stops_when_cancelled() {
        let params = ChainParams::regtest();
        let chain = ChainManager::open(
            params.clone(),
            ferrite_state::ChainConfig::default(),
            Arc::new(ferrite_storage::MemoryStorage::new()),
            Arc::new(ferrite_state::MemoryBlockFiles::new()),
            Collaborators::default(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = import_blocks(&chain, &encode(&mine_chain(&params, 2)), &cancel).unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.processed, 0);
    }
}
