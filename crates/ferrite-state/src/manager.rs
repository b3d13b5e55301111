//! Chain manager coordinating the block tree, the active chain and the
//! UTXO set.
//!
//! Structural state (active chain, candidate set, in-flight validations)
//! lives behind one main lock. The UTXO set has its own lock and is always
//! taken after the main lock.

use crate::block_store::{load_block, BlockFiles};
use crate::chain::Chain;
use crate::config::ChainConfig;
use crate::descriptor::{BlockDescriptor, BlockHandle, BlockValidity, ValidationTime};
use crate::error::{ActivateOutcome, BlockRejection, ChainError, ChainResult};
use crate::mempool::{MempoolSink, NullMempool};
use crate::persistence::{index_batch, load_block_index, recompute_derived};
use crate::selector::ChainSelector;
use crate::tree::BlockTree;
use crate::utxo::UtxoSet;
use crate::{StateError, StateResult};
use ferrite_consensus::{
    check_block, check_proof_of_work, AcceptAllScripts, Block, BlockHeader, ChainParams,
    ConsensusError, FrozenOutputs, Hash256, NoFrozenOutputs, ScriptChecker,
};
use ferrite_storage::Storage;
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// External services the chain manager calls into.
pub struct Collaborators {
    pub scripts: Arc<dyn ScriptChecker>,
    pub frozen: Arc<dyn FrozenOutputs>,
    pub mempool: Arc<dyn MempoolSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            scripts: Arc::new(AcceptAllScripts),
            frozen: Arc::new(NoFrozenOutputs),
            mempool: Arc::new(NullMempool),
        }
    }
}

/// State guarded by the main lock.
pub(crate) struct MainState {
    pub(crate) chain: Chain,
    pub(crate) selector: ChainSelector,
    /// Blocks whose scripts are being checked, with their cancellation
    /// tokens.
    pub(crate) in_flight: HashMap<BlockHandle, CancellationToken>,
    /// Next sequence id handed out by `prioritize_block`; strictly
    /// decreasing.
    pub(crate) precious_counter: i64,
    /// Tip work when the counter was last used.
    pub(crate) last_precious_work: BigUint,
    pub(crate) rejections: HashMap<BlockHandle, BlockRejection>,
}

impl MainState {
    fn new() -> Self {
        Self {
            chain: Chain::new(),
            selector: ChainSelector::new(),
            in_flight: HashMap::new(),
            precious_counter: -1,
            last_precious_work: BigUint::default(),
            rejections: HashMap::new(),
        }
    }

    pub(crate) fn tip(&self) -> Option<Arc<BlockDescriptor>> {
        self.chain.tip().cloned()
    }
}

/// When [`ChainManager::flush`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Only when the cache is over its memory budget.
    IfNeeded,
    /// Over budget or the flush interval has elapsed.
    Periodic,
    /// Unconditionally.
    Always,
}

/// Summary of the chain state.
#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub tip: Option<Hash256>,
    pub height: i32,
    pub chain_work: BigUint,
    pub utxo_best_block: Hash256,
    pub descriptors: usize,
    pub candidates: usize,
    pub unlinked: usize,
    pub utxo_cache_entries: usize,
    pub utxo_memory: usize,
    pub aborted: bool,
}

/// The chainstate engine.
pub struct ChainManager {
    pub(crate) params: ChainParams,
    pub(crate) config: ChainConfig,
    pub(crate) tree: BlockTree,
    pub(crate) utxo: UtxoSet,
    pub(crate) block_files: Arc<dyn BlockFiles>,
    pub(crate) scripts: Arc<dyn ScriptChecker>,
    pub(crate) frozen: Arc<dyn FrozenOutputs>,
    pub(crate) mempool: Arc<dyn MempoolSink>,
    pub(crate) main: Mutex<MainState>,
    pub(crate) script_pool: rayon::ThreadPool,
    aborted: AtomicBool,
    last_flush: Mutex<Instant>,
}

impl ChainManager {
    /// Open the chain state over `storage` and `block_files`.
    ///
    /// Loads the block index, recomputes every derived field, rebuilds the
    /// active chain up to the UTXO set's best block and activates the best
    /// candidate. A fresh store is initialized with the genesis block.
    #[instrument(skip_all, fields(network = ?params.network))]
    pub fn open(
        params: ChainParams,
        config: ChainConfig,
        storage: Arc<dyn Storage>,
        block_files: Arc<dyn BlockFiles>,
        collaborators: Collaborators,
    ) -> StateResult<Self> {
        if config.soft_freeze_duration < 0 {
            return Err(StateError::Config(format!(
                "soft_freeze_duration must not be negative, got {}",
                config.soft_freeze_duration
            )));
        }

        let tree = BlockTree::new(params.genesis_hash());
        load_block_index(storage.as_ref(), &tree)?;
        let utxo = UtxoSet::open(Arc::clone(&storage), config.cache_max_entries)?;
        let script_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.script_threads)
            .thread_name(|i| format!("script-check-{}", i))
            .build()
            .map_err(|e| StateError::ThreadPool(e.to_string()))?;

        let manager = Self {
            params,
            config,
            tree,
            utxo,
            block_files,
            scripts: collaborators.scripts,
            frozen: collaborators.frozen,
            mempool: collaborators.mempool,
            main: Mutex::new(MainState::new()),
            script_pool,
            aborted: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
        };
        manager.restore()?;
        let outcome = manager.activate_inner(&CancellationToken::new())?;

        let info = manager.info();
        info!(
            height = info.height,
            tip = ?info.tip,
            descriptors = info.descriptors,
            candidates = info.candidates,
            ?outcome,
            "Chain manager opened"
        );
        Ok(manager)
    }

    /// Rebuild in-memory state from the loaded descriptors.
    fn restore(&self) -> StateResult<()> {
        if self.tree.is_empty() {
            self.init_genesis()?;
        }
        recompute_derived(&self.tree);

        let mut main = self.main.lock();
        let best = self.utxo.best_block();
        let tip = if best.is_zero() {
            None
        } else {
            let tip = self.tree.get(&best).ok_or_else(|| {
                StateError::Corruption(format!(
                    "UTXO best block {} is not in the block index",
                    best
                ))
            })?;
            if !tip.is_linked() || tip.is_invalid() {
                return Err(StateError::Corruption(format!(
                    "UTXO best block {} is not a usable chain tip",
                    best
                )));
            }
            Some(tip)
        };
        main.chain.set_tip(&self.tree, tip.clone());

        let loaded_at = Instant::now();
        let MainState {
            chain, selector, ..
        } = &mut *main;
        self.tree.for_each(|desc| {
            let time = if chain.contains(desc) {
                ValidationTime::Earliest
            } else if desc.is_valid(BlockValidity::Scripts) {
                ValidationTime::At(loaded_at)
            } else {
                ValidationTime::Never
            };
            desc.set_validation_time(time);

            if desc.has_data() && !desc.is_linked() && !desc.is_invalid() {
                if let Some(parent) = desc.parent_handle() {
                    selector.add_unlinked(parent, desc.handle());
                }
            }
        });
        selector.rebuild(&self.tree, tip.as_deref());

        debug!(
            height = chain.height(),
            candidates = selector.len(),
            unlinked = selector.unlinked_len(),
            "Restored chain state"
        );
        Ok(())
    }

    fn init_genesis(&self) -> StateResult<()> {
        let genesis = self.params.genesis_block();
        let desc = self.tree.insert(genesis.header.clone())?.into_descriptor();
        self.store_block_data(&desc, &genesis)?;
        info!(hash = %desc.hash(), "Initialized block index with genesis");
        Ok(())
    }

    fn store_block_data(&self, desc: &BlockDescriptor, block: &Block) -> StateResult<()> {
        let bytes = block.to_bytes();
        let pos = self.block_files.write_block(&bytes)?;
        desc.set_block_data(pos, bytes.len() as u32, block.transactions.len() as u32);
        desc.raise_validity(BlockValidity::Transactions);
        Ok(())
    }

    /// Run a mutating operation, halting the manager on a fatal error.
    pub(crate) fn guarded<T>(&self, op: impl FnOnce() -> ChainResult<T>) -> ChainResult<T> {
        if self.is_aborted() {
            return Err(StateError::Aborted.into());
        }
        let result = op();
        if let Err(ChainError::System(err)) = &result {
            if err.is_fatal() {
                self.abort(err);
            }
        }
        result
    }

    fn abort(&self, err: &StateError) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            error!(
                error = %err,
                "System error in chain state; block processing halted, operator intervention required"
            );
        }
    }

    /// Whether a system error has halted block processing.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    // Queries.

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn utxo(&self) -> &UtxoSet {
        &self.utxo
    }

    pub fn tip(&self) -> Option<Arc<BlockDescriptor>> {
        self.main.lock().tip()
    }

    /// Height of the active tip, -1 before genesis is connected.
    pub fn height(&self) -> i32 {
        self.main.lock().chain.height()
    }

    pub fn get_descriptor(&self, hash: &Hash256) -> Option<Arc<BlockDescriptor>> {
        self.tree.get(hash)
    }

    /// Active-chain block at `height`.
    pub fn block_at(&self, height: i32) -> Option<Arc<BlockDescriptor>> {
        self.main.lock().chain.get(height).cloned()
    }

    pub fn is_on_active_chain(&self, hash: &Hash256) -> bool {
        match self.tree.get(hash) {
            Some(desc) => self.main.lock().chain.contains(&desc),
            None => false,
        }
    }

    /// Current candidate tips, best first.
    pub fn candidates(&self) -> Vec<Hash256> {
        let main = self.main.lock();
        main.selector
            .handles()
            .into_iter()
            .filter_map(|h| self.tree.get_by_handle(h))
            .map(|d| d.hash())
            .collect()
    }

    /// Why a block was rejected, if it was.
    pub fn rejection(&self, hash: &Hash256) -> Option<BlockRejection> {
        let desc = self.tree.get(hash)?;
        if !desc.is_invalid() {
            return None;
        }
        Some(self.rejection_for(&self.main.lock(), &desc))
    }

    pub(crate) fn rejection_for(&self, main: &MainState, desc: &BlockDescriptor) -> BlockRejection {
        if let Some(rejection) = main.rejections.get(&desc.handle()) {
            return rejection.clone();
        }
        let error = if desc.is_failed_parent() {
            ConsensusError::BadPrevBlock(desc.header().prev_hash)
        } else {
            ConsensusError::KnownInvalid(desc.hash())
        };
        BlockRejection::new(desc.hash(), error)
    }

    /// Read a stored block.
    pub fn read_block(&self, hash: &Hash256) -> StateResult<Block> {
        let desc = self
            .tree
            .get(hash)
            .ok_or(StateError::UnknownBlock(*hash))?;
        let pos = desc.data_pos().ok_or(StateError::MissingBlockData(*hash))?;
        load_block(self.block_files.as_ref(), pos)
    }

    pub fn info(&self) -> ChainInfo {
        let main = self.main.lock();
        let tip = main.chain.tip();
        ChainInfo {
            tip: tip.map(|t| t.hash()),
            height: main.chain.height(),
            chain_work: tip.map(|t| t.chain_work().clone()).unwrap_or_default(),
            utxo_best_block: self.utxo.best_block(),
            descriptors: self.tree.len(),
            candidates: main.selector.len(),
            unlinked: main.selector.unlinked_len(),
            utxo_cache_entries: self.utxo.cache_len(),
            utxo_memory: self.utxo.memory_usage(),
            aborted: self.is_aborted(),
        }
    }

    // Acceptance.

    /// Accept a header into the block tree.
    ///
    /// A known header is returned as is unless it is invalid. Headers with
    /// an invalid parent are stored failed-by-parent and rejected.
    pub fn accept_header(&self, header: BlockHeader) -> ChainResult<Arc<BlockDescriptor>> {
        self.guarded(|| {
            let mut main = self.main.lock();
            self.accept_header_locked(&mut main, header)
        })
    }

    fn accept_header_locked(
        &self,
        main: &mut MainState,
        header: BlockHeader,
    ) -> ChainResult<Arc<BlockDescriptor>> {
        let hash = header.hash();
        if let Some(existing) = self.tree.get(&hash) {
            if existing.is_invalid() {
                return Err(ChainError::Rejected(self.rejection_for(main, &existing)));
            }
            return Ok(existing);
        }

        if let Err(err) = check_proof_of_work(&header, &self.params) {
            return Err(self.log_rejection(BlockRejection::new(hash, err), None));
        }
        let Some(parent) = self.tree.get(&header.prev_hash) else {
            let rejection =
                BlockRejection::new(hash, ConsensusError::UnknownParent(header.prev_hash));
            return Err(self.log_rejection(rejection, None));
        };

        let desc = self.tree.insert(header)?.into_descriptor();
        if parent.is_invalid() {
            desc.mark_failed_parent();
            let rejection = BlockRejection::new(hash, ConsensusError::BadPrevBlock(parent.hash()));
            main.rejections.insert(desc.handle(), rejection.clone());
            return Err(self.log_rejection(rejection, Some(desc.height())));
        }
        desc.set_sequence_id(self.tree.next_sequence_id());
        debug!(hash = %hash, height = desc.height(), "Accepted header");
        Ok(desc)
    }

    fn log_rejection(&self, rejection: BlockRejection, height: Option<i32>) -> ChainError {
        warn!(
            hash = %rejection.hash,
            height,
            reason = rejection.reason(),
            ban_score = rejection.ban_score(),
            error = %rejection.error,
            "Rejected block"
        );
        ChainError::Rejected(rejection)
    }

    /// Accept a full block: header, structural checks, block data.
    ///
    /// The block becomes a selection candidate once all its ancestors have
    /// data. It is not connected; see [`ChainManager::process_block`].
    pub fn accept_block(&self, block: &Block) -> ChainResult<Arc<BlockDescriptor>> {
        self.guarded(|| {
            let mut main = self.main.lock();
            self.accept_block_locked(&mut main, block)
        })
    }

    fn accept_block_locked(
        &self,
        main: &mut MainState,
        block: &Block,
    ) -> ChainResult<Arc<BlockDescriptor>> {
        let desc = self.accept_header_locked(main, block.header.clone())?;
        if desc.has_data() {
            return Ok(desc);
        }

        if let Err(err) = check_block(block, &self.params) {
            let rejection = BlockRejection::new(desc.hash(), err);
            if rejection.error.may_be_mutated() {
                return Err(self.log_rejection(rejection, Some(desc.height())));
            }
            self.invalid_block_found(main, &desc, rejection.clone());
            return Err(ChainError::Rejected(rejection));
        }

        self.store_block_data(&desc, block)?;
        self.link_block(main, &desc);
        debug!(
            hash = %desc.hash(),
            height = desc.height(),
            txs = block.transactions.len(),
            linked = desc.is_linked(),
            "Accepted block"
        );
        Ok(desc)
    }

    /// Set chain-tx for `desc` and every waiting descendant that becomes
    /// linked with it, offering each to the candidate set.
    fn link_block(&self, main: &mut MainState, desc: &Arc<BlockDescriptor>) {
        let parent = self.tree.parent(desc);
        if let Some(parent) = parent.as_ref().filter(|p| !p.is_linked()) {
            main.selector.add_unlinked(parent.handle(), desc.handle());
            return;
        }

        let mut queue = VecDeque::from([Arc::clone(desc)]);
        while let Some(next) = queue.pop_front() {
            let base = self.tree.parent(&next).map_or(0, |p| p.chain_tx());
            next.set_chain_tx(base + u64::from(next.tx_count()));
            let tip = main.tip();
            main.selector.try_add(&next, tip.as_deref());
            for handle in main.selector.take_unlinked(next.handle()) {
                if let Some(child) = self.tree.get_by_handle(handle) {
                    queue.push_back(child);
                }
            }
        }
    }

    /// Accept `block` and activate the best chain.
    ///
    /// Returns `Rejected` when the block itself turned out invalid, whether
    /// during acceptance or while connecting it.
    #[instrument(skip_all, fields(hash = %block.hash()))]
    pub fn process_block(
        &self,
        block: &Block,
        cancel: &CancellationToken,
    ) -> ChainResult<ActivateOutcome> {
        let desc = self.accept_block(block)?;
        let outcome = self.activate_best_chain(cancel)?;
        if desc.is_invalid() {
            let main = self.main.lock();
            return Err(ChainError::Rejected(self.rejection_for(&main, &desc)));
        }
        Ok(outcome)
    }

    // Persistence.

    /// Persist dirty descriptors and the UTXO cache according to `mode`.
    /// Returns whether anything was written.
    pub fn flush(&self, mode: FlushMode) -> ChainResult<bool> {
        self.guarded(|| {
            let _main = self.main.lock();
            Ok(self.flush_locked(mode)?)
        })
    }

    /// Flush with the main lock held by the caller.
    #[instrument(skip(self))]
    pub(crate) fn flush_locked(&self, mode: FlushMode) -> StateResult<bool> {
        let over_budget = self.utxo.memory_usage() > self.config.cache_budget_bytes;
        let interval_due = self.last_flush.lock().elapsed() >= self.config.flush_interval();
        let due = match mode {
            FlushMode::IfNeeded => over_budget,
            FlushMode::Periodic => over_budget || interval_due,
            FlushMode::Always => true,
        };
        if !due {
            return Ok(false);
        }

        self.block_files.sync()?;
        let dirty = self.tree.extract_dirty();
        let stats = match self.utxo.flush(index_batch(&dirty)) {
            Ok(stats) => stats,
            Err(err) => {
                for desc in &dirty {
                    self.tree.mark_dirty(desc);
                }
                return Err(err);
            }
        };
        *self.last_flush.lock() = Instant::now();
        debug!(
            descriptors = dirty.len(),
            coins_written = stats.written,
            coins_deleted = stats.deleted,
            evicted = stats.evicted,
            over_budget,
            "Flushed chain state"
        );
        Ok(true)
    }

    /// Cancel running validations and flush everything.
    pub fn shutdown(&self) -> ChainResult<()> {
        {
            let main = self.main.lock();
            for token in main.in_flight.values() {
                token.cancel();
            }
        }
        self.flush(FlushMode::Always)?;
        info!("Chain state shut down");
        Ok(())
    }
}
