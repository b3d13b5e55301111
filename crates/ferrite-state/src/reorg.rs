//! Moving the active chain to the best candidate.
//!
//! One activation step disconnects the active chain back to the fork point
//! of the chosen candidate, then connects the candidate's branch block by
//! block. Script checks of a block run on the script pool; with parallel
//! validation enabled the main lock is released meanwhile and the UTXO
//! span is detached, and the connection only commits if nothing else moved
//! the chain in between.

use crate::block_store::{load_block, load_undo, store_undo};
use crate::chain::Chain;
use crate::coins::{BlockUndo, Coin, TxUndo};
use crate::descriptor::{BlockDescriptor, BlockHandle, BlockValidity};
use crate::error::{ActivateOutcome, BlockRejection, ChainResult};
use crate::manager::{ChainManager, FlushMode, MainState};
use crate::policy::apply_soft_consensus_freeze;
use crate::utxo::{Reattach, TryFlush, UtxoSpan};
use crate::{StateError, StateResult};
use ferrite_consensus::{
    block_subsidy, check_block, money_range, Amount, Block, ConsensusError, OutPoint,
    ScriptCheckResult, ScriptFlags, Transaction, TxOut,
};
use parking_lot::MutexGuard;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

enum StepOutcome {
    Progress,
    LostRace,
    Cancelled,
}

enum ConnectOutcome {
    Connected,
    Invalid(BlockRejection),
    /// Spends an output under a consensus freeze.
    Frozen,
    LostRace,
    Cancelled,
}

/// Inputs for checking the scripts of one transaction.
struct ScriptJob {
    tx_index: usize,
    spent: Vec<TxOut>,
}

enum Applied {
    Ok { undo: BlockUndo, jobs: Vec<ScriptJob> },
    Rejected(ConsensusError),
    Frozen,
}

enum ScriptVerdict {
    Valid,
    Invalid(ConsensusError),
    Cancelled,
}

impl ChainManager {
    /// Move the active chain to the best eligible candidate.
    ///
    /// Returns `Cancelled` if `cancel` fired; the chain is then at some
    /// consistent intermediate tip.
    pub fn activate_best_chain(&self, cancel: &CancellationToken) -> ChainResult<ActivateOutcome> {
        self.guarded(|| Ok(self.activate_inner(cancel)?))
    }

    #[instrument(skip_all)]
    pub(crate) fn activate_inner(&self, cancel: &CancellationToken) -> StateResult<ActivateOutcome> {
        let start_tip = self.main.lock().tip().map(|t| t.handle());
        let mut lost_races = 0u32;

        let outcome = loop {
            if cancel.is_cancelled() {
                break ActivateOutcome::Cancelled;
            }
            let mut main = self.main.lock();
            let in_flight: HashSet<BlockHandle> = main.in_flight.keys().copied().collect();
            let MainState {
                chain, selector, ..
            } = &mut *main;
            let Some(best) = selector.find_best(&self.tree, chain, &in_flight) else {
                break ActivateOutcome::Completed;
            };
            if chain.tip().map_or(false, |t| t.handle() == best.handle()) {
                break ActivateOutcome::Completed;
            }

            match self.activate_step(&mut main, &best, cancel)? {
                StepOutcome::Progress => {}
                StepOutcome::LostRace => {
                    lost_races += 1;
                    if lost_races > self.config.max_race_retries {
                        warn!(
                            candidate = %best.hash(),
                            lost_races,
                            "Block validation keeps losing races; retrying"
                        );
                    } else {
                        debug!(candidate = %best.hash(), lost_races, "Lost validation race; retrying");
                    }
                }
                StepOutcome::Cancelled => break ActivateOutcome::Cancelled,
            }
        };

        let main = self.main.lock();
        let tip_changed = main.tip().map(|t| t.handle()) != start_tip;
        self.flush_locked(if tip_changed {
            FlushMode::Always
        } else {
            FlushMode::IfNeeded
        })?;
        Ok(outcome)
    }

    /// Disconnect to the fork point of `best`, then connect its branch.
    fn activate_step(
        &self,
        main: &mut MutexGuard<'_, MainState>,
        best: &Arc<BlockDescriptor>,
        cancel: &CancellationToken,
    ) -> StateResult<StepOutcome> {
        let fork_height = main
            .chain
            .find_fork(&self.tree, best)
            .map_or(-1, |fork| fork.height());

        if !self.rewind(main, |chain| chain.height() > fork_height, Some(cancel))? {
            return Ok(StepOutcome::Cancelled);
        }

        let mut path = Vec::new();
        let mut walk = Some(Arc::clone(best));
        while let Some(desc) = walk {
            if desc.height() <= fork_height {
                break;
            }
            walk = self.tree.parent(&desc);
            path.push(desc);
        }

        for desc in path.iter().rev() {
            if cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }
            match self.connect_tip(main, desc, cancel)? {
                ConnectOutcome::Connected => {}
                ConnectOutcome::Invalid(rejection) => {
                    self.invalid_block_found(main, desc, rejection);
                    return Ok(StepOutcome::Progress);
                }
                ConnectOutcome::Frozen => {
                    let depth = self.config.soft_freeze_duration;
                    apply_soft_consensus_freeze(&self.tree, desc, depth);
                    warn!(
                        hash = %desc.hash(),
                        height = desc.height(),
                        depth,
                        "Block spends a frozen output; soft consensus freeze applied"
                    );
                    return Ok(StepOutcome::Progress);
                }
                ConnectOutcome::LostRace => return Ok(StepOutcome::LostRace),
                ConnectOutcome::Cancelled if cancel.is_cancelled() => {
                    return Ok(StepOutcome::Cancelled)
                }
                ConnectOutcome::Cancelled => return Ok(StepOutcome::LostRace),
            }
        }

        if let Some(tip) = main.tip() {
            let pruned = main.selector.prune(&tip);
            debug!(tip = %tip.hash(), pruned, "Pruned weaker candidates");
        }
        Ok(StepOutcome::Progress)
    }

    /// Disconnect tips while `more` holds, handing the transactions of the
    /// disconnected blocks back to the mempool oldest first, also when a
    /// disconnect fails. Returns `false` if stopped by `cancel`.
    pub(crate) fn rewind(
        &self,
        main: &mut MainState,
        mut more: impl FnMut(&Chain) -> bool,
        cancel: Option<&CancellationToken>,
    ) -> StateResult<bool> {
        let mut returning = Vec::new();
        let mut result = Ok(true);
        while more(&main.chain) {
            if cancel.map_or(false, CancellationToken::is_cancelled) {
                result = Ok(false);
                break;
            }
            match self.disconnect_tip(main) {
                Ok(txs) => returning.push(txs),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if !returning.is_empty() {
            let txs: Vec<Transaction> = returning.into_iter().rev().flatten().collect();
            self.mempool.return_to_pool(txs);
        }
        result
    }

    /// Undo the active tip against the UTXO set. Returns its non-coinbase
    /// transactions.
    #[instrument(skip_all)]
    pub(crate) fn disconnect_tip(&self, main: &mut MainState) -> StateResult<Vec<Transaction>> {
        let tip = main
            .tip()
            .ok_or_else(|| StateError::Inconsistent("disconnect with an empty chain".into()))?;
        let parent = self
            .tree
            .parent(&tip)
            .ok_or_else(|| StateError::Inconsistent("cannot disconnect the genesis block".into()))?;

        let block = load_block(
            self.block_files.as_ref(),
            tip.data_pos().ok_or(StateError::MissingBlockData(tip.hash()))?,
        )?;
        let undo = load_undo(
            self.block_files.as_ref(),
            tip.undo_pos().ok_or(StateError::MissingBlockData(tip.hash()))?,
        )?;
        if undo.txs.len() + 1 != block.transactions.len() {
            return Err(StateError::Corruption(format!(
                "undo for {} covers {} transactions, block has {}",
                tip.hash(),
                undo.txs.len(),
                block.transactions.len()
            )));
        }

        let mut span = self.utxo.span();
        if span.best_block() != tip.hash() {
            return Err(StateError::Inconsistent(format!(
                "UTXO best block {} is not the tip {}",
                span.best_block(),
                tip.hash()
            )));
        }

        let mut clean = true;
        for (index, tx) in block.transactions.iter().enumerate().rev() {
            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            let is_confiscation = tx.is_confiscation();
            for (vout, output) in tx.outputs.iter().enumerate() {
                if output.is_unspendable() {
                    continue;
                }
                let expected = Coin::from_output(output, tip.height(), is_coinbase, is_confiscation);
                match span.spend_coin(&OutPoint::new(txid, vout as u32))? {
                    Some(coin) if coin == expected => {}
                    _ => clean = false,
                }
            }

            if index == 0 {
                continue;
            }
            let tx_undo = undo
                .txs
                .get(index - 1)
                .filter(|u| u.spent.len() == tx.inputs.len())
                .ok_or_else(|| {
                    StateError::Corruption(format!("undo mismatch for transaction {}", txid))
                })?;
            for (input, coin) in tx.inputs.iter().zip(&tx_undo.spent).rev() {
                if span.have(&input.prevout)? {
                    clean = false;
                }
                span.add_coin(input.prevout, coin.clone(), true)?;
            }
        }
        if !clean {
            warn!(
                hash = %tip.hash(),
                height = tip.height(),
                "Disconnected block did not match the UTXO set exactly"
            );
        }

        span.set_best_block(parent.hash());
        if span.try_flush() == TryFlush::Invalidated {
            return Err(StateError::Inconsistent(
                "UTXO span invalidated while disconnecting".into(),
            ));
        }
        drop(span);

        main.chain.set_tip(&self.tree, Some(Arc::clone(&parent)));
        info!(hash = %tip.hash(), height = tip.height(), "Disconnected block");
        Ok(block
            .transactions
            .into_iter()
            .filter(|tx| !tx.is_coinbase())
            .collect())
    }

    /// Connect `desc`, whose parent must be the active tip.
    #[instrument(skip_all, fields(hash = %desc.hash(), height = desc.height()))]
    fn connect_tip(
        &self,
        main: &mut MutexGuard<'_, MainState>,
        desc: &Arc<BlockDescriptor>,
        cancel: &CancellationToken,
    ) -> StateResult<ConnectOutcome> {
        let block = load_block(
            self.block_files.as_ref(),
            desc.data_pos().ok_or(StateError::MissingBlockData(desc.hash()))?,
        )?;
        if let Err(err) = check_block(&block, &self.params) {
            return Ok(ConnectOutcome::Invalid(BlockRejection::new(desc.hash(), err)));
        }

        let mut span = self.utxo.span();
        let expected_base = main.tip().map(|t| t.hash()).unwrap_or_default();
        if span.best_block() != expected_base || desc.header().prev_hash != expected_base {
            return Err(StateError::Inconsistent(format!(
                "connecting {} on {} but the UTXO best block is {}",
                desc.hash(),
                desc.header().prev_hash,
                span.best_block()
            )));
        }

        let is_genesis = desc.parent_handle().is_none();
        let (undo, jobs) = if is_genesis {
            // Genesis outputs are not spendable.
            (BlockUndo::default(), Vec::new())
        } else {
            match self.apply_block(&mut span, desc, &block)? {
                Applied::Ok { undo, jobs } => (undo, jobs),
                Applied::Rejected(err) => {
                    return Ok(ConnectOutcome::Invalid(BlockRejection::new(desc.hash(), err)))
                }
                Applied::Frozen => return Ok(ConnectOutcome::Frozen),
            }
        };

        if !jobs.is_empty() {
            let token = cancel.child_token();
            main.in_flight.insert(desc.handle(), token.clone());
            let flags = self.params.script_flags(desc.height());
            let verdict = if self.config.parallel_validation {
                span.detach();
                MutexGuard::unlocked(main, || self.run_scripts(&block, &jobs, flags, &token))
            } else {
                self.run_scripts(&block, &jobs, flags, &token)
            };
            main.in_flight.remove(&desc.handle());

            match verdict {
                ScriptVerdict::Valid => {}
                ScriptVerdict::Invalid(err) => {
                    return Ok(ConnectOutcome::Invalid(BlockRejection::new(desc.hash(), err)))
                }
                ScriptVerdict::Cancelled => {
                    debug!("Script checks cancelled");
                    return Ok(ConnectOutcome::Cancelled);
                }
            }

            if self.config.parallel_validation {
                let moved = main.tip().map(|t| t.hash()).unwrap_or_default() != expected_base;
                if moved || desc.is_invalid() || span.reattach() == Reattach::LostRace {
                    debug!("Chain moved during script checks");
                    return Ok(ConnectOutcome::LostRace);
                }
            }
        }

        if !is_genesis && !desc.has_undo() {
            let pos = store_undo(self.block_files.as_ref(), &undo)?;
            desc.set_undo_pos(pos);
        }
        desc.raise_validity(BlockValidity::Scripts);
        span.set_best_block(desc.hash());
        if span.try_flush() == TryFlush::Invalidated {
            debug!("UTXO span invalidated on commit");
            return Ok(ConnectOutcome::LostRace);
        }
        drop(span);

        desc.mark_validated(Instant::now());
        main.selector.rekey(desc);
        main.chain.set_tip(&self.tree, Some(Arc::clone(desc)));
        for (handle, token) in &main.in_flight {
            if *handle != desc.handle() {
                token.cancel();
            }
        }

        self.mempool.remove_for_block(&block.transactions);

        info!(txs = block.transactions.len(), "Connected block");
        Ok(ConnectOutcome::Connected)
    }

    /// Apply the transactions of `block` to `span`, checking contextual
    /// rules and collecting the script checks to run.
    fn apply_block(
        &self,
        span: &mut UtxoSpan<'_>,
        desc: &Arc<BlockDescriptor>,
        block: &Block,
    ) -> StateResult<Applied> {
        let height = desc.height();

        if desc.freeze_explicit() < 0 {
            let frozen = block
                .transactions
                .iter()
                .skip(1)
                .flat_map(|tx| &tx.inputs)
                .any(|input| self.frozen.is_frozen(&input.prevout, height));
            if frozen {
                return Ok(Applied::Frozen);
            }
        }

        let enforce_bip30 = self.enforces_bip30(desc);
        if enforce_bip30 {
            for tx in &block.transactions {
                let txid = tx.txid();
                for vout in 0..tx.outputs.len() as u32 {
                    if span.have(&OutPoint::new(txid, vout))? {
                        return Ok(Applied::Rejected(ConsensusError::Bip30 { txid }));
                    }
                }
            }
        }

        let mut undo = BlockUndo::default();
        let mut jobs = Vec::new();
        let mut fees: Amount = 0;
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            let Some(value_out) = tx.output_total() else {
                return Ok(Applied::Rejected(ConsensusError::OutputTotalTooLarge { txid }));
            };

            if !is_coinbase {
                let mut spent = Vec::with_capacity(tx.inputs.len());
                let mut value_in: Amount = 0;
                for input in &tx.inputs {
                    let outpoint = input.prevout;
                    let Some(coin) = span.spend_coin(&outpoint)? else {
                        return Ok(Applied::Rejected(ConsensusError::MissingOrSpent { outpoint }));
                    };
                    let depth = height - coin.height;
                    if coin.needs_maturity() && depth < self.params.coinbase_maturity {
                        return Ok(Applied::Rejected(ConsensusError::PrematureCoinbaseSpend {
                            outpoint,
                            depth,
                        }));
                    }
                    if !money_range(coin.value) {
                        return Ok(Applied::Rejected(ConsensusError::InputValuesOutOfRange {
                            txid,
                        }));
                    }
                    value_in += coin.value;
                    if !money_range(value_in) {
                        return Ok(Applied::Rejected(ConsensusError::InputValuesOutOfRange {
                            txid,
                        }));
                    }
                    spent.push(coin);
                }
                if value_in < value_out {
                    return Ok(Applied::Rejected(ConsensusError::InBelowOut {
                        txid,
                        inputs: value_in,
                        outputs: value_out,
                    }));
                }
                fees += value_in - value_out;
                if !money_range(fees) {
                    return Ok(Applied::Rejected(ConsensusError::FeeOutOfRange));
                }

                let outputs = spent
                    .iter()
                    .map(Coin::to_output)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        StateError::Inconsistent(format!("spent coin without script in {}", txid))
                    })?;
                jobs.push(ScriptJob {
                    tx_index,
                    spent: outputs,
                });
                undo.txs.push(TxUndo { spent });
            }

            let is_confiscation = tx.is_confiscation();
            for (vout, output) in tx.outputs.iter().enumerate() {
                if output.is_unspendable() {
                    continue;
                }
                span.add_coin(
                    OutPoint::new(txid, vout as u32),
                    Coin::from_output(output, height, is_coinbase, is_confiscation),
                    is_coinbase || !enforce_bip30,
                )?;
            }
        }

        let limit = fees + block_subsidy(height, &self.params);
        let paid = block
            .transactions
            .first()
            .and_then(Transaction::output_total)
            .unwrap_or(Amount::MAX);
        if paid > limit {
            return Ok(Applied::Rejected(ConsensusError::BadCoinbaseAmount {
                actual: paid,
                limit,
            }));
        }
        Ok(Applied::Ok { undo, jobs })
    }

    /// The duplicate-output check applies except to the listed exception
    /// blocks and to blocks past the BIP34 activation block.
    fn enforces_bip30(&self, desc: &Arc<BlockDescriptor>) -> bool {
        if self.params.is_bip30_exception(desc.height(), &desc.hash()) {
            return false;
        }
        match self.params.bip34_hash {
            Some(bip34_hash) if desc.height() >= self.params.bip34_height => self
                .tree
                .ancestor(desc, self.params.bip34_height)
                .map_or(true, |a| a.hash() != bip34_hash),
            _ => true,
        }
    }

    fn run_scripts(
        &self,
        block: &Block,
        jobs: &[ScriptJob],
        flags: ScriptFlags,
        token: &CancellationToken,
    ) -> ScriptVerdict {
        let started = Instant::now();
        let verdict = self.script_pool.install(|| {
            jobs.par_iter().find_map_any(|job| {
                let tx = &block.transactions[job.tx_index];
                match self.scripts.check_inputs(tx, &job.spent, flags, token) {
                    ScriptCheckResult::Valid => None,
                    ScriptCheckResult::Invalid(reason) => {
                        Some(ScriptVerdict::Invalid(ConsensusError::ScriptFailure {
                            txid: tx.txid(),
                            reason,
                        }))
                    }
                    ScriptCheckResult::Cancelled => Some(ScriptVerdict::Cancelled),
                }
            })
        });
        debug!(
            txs = jobs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Checked scripts"
        );
        verdict.unwrap_or(ScriptVerdict::Valid)
    }

    /// Record a consensus failure of `desc`: mark it failed, its
    /// descendants failed-by-parent, and drop all of them from the
    /// candidate set.
    pub(crate) fn invalid_block_found(
        &self,
        main: &mut MainState,
        desc: &Arc<BlockDescriptor>,
        rejection: BlockRejection,
    ) {
        desc.mark_failed();
        main.selector.remove(desc.handle());
        for child in self.tree.descendants(desc, i32::MAX) {
            child.mark_failed_parent();
            main.selector.remove(child.handle());
        }
        warn!(
            hash = %rejection.hash,
            height = desc.height(),
            reason = rejection.reason(),
            ban_score = rejection.ban_score(),
            error = %rejection.error,
            "Rejected invalid block"
        );
        main.rejections.insert(desc.handle(), rejection);
    }
}

#[cfg(test)]
mod tests {
    use crate::block_store::MemoryBlockFiles;
    use crate::config::ChainConfig;
    use crate::manager::{ChainManager, Collaborators};
    use crate::mempool::MempoolSink;
    use crate::test_blocks::{spend, ChainBuilder};
    use ferrite_consensus::{
        block_subsidy, ChainParams, FrozenOutputs, Hash256, OutPoint, ScriptCheckResult,
        ScriptChecker, ScriptFlags, Transaction, TxOut,
    };
    use ferrite_storage::MemoryStorage;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn params() -> ChainParams {
        let mut params = ChainParams::regtest();
        params.coinbase_maturity = 1;
        params
    }

    fn manager_with(config: ChainConfig, collaborators: Collaborators) -> ChainManager {
        ChainManager::open(
            params(),
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryBlockFiles::new()),
            collaborators,
        )
        .unwrap()
    }

    fn manager() -> ChainManager {
        manager_with(ChainConfig::default(), Collaborators::default())
    }

    fn process(manager: &ChainManager, block: &ferrite_consensus::Block) {
        manager
            .process_block(block, &CancellationToken::new())
            .unwrap();
    }

    #[derive(Default)]
    struct RecordingMempool {
        events: Mutex<Vec<String>>,
    }

    impl MempoolSink for RecordingMempool {
        fn remove_for_block(&self, txs: &[Transaction]) {
            self.events.lock().push(format!("remove {}", txs.len()));
        }

        fn return_to_pool(&self, txs: Vec<Transaction>) {
            self.events.lock().push(format!("return {}", txs.len()));
        }

        fn check_conflicts(&self, _tx: &Transaction) -> Vec<Hash256> {
            Vec::new()
        }
    }

    struct RejectScript(Vec<u8>);

    impl ScriptChecker for RejectScript {
        fn check_inputs(
            &self,
            tx: &Transaction,
            _spent: &[TxOut],
            _flags: ScriptFlags,
            _cancel: &CancellationToken,
        ) -> ScriptCheckResult {
            if tx.inputs.iter().any(|i| i.script_sig == self.0) {
                ScriptCheckResult::Invalid("script rejected".into())
            } else {
                ScriptCheckResult::Valid
            }
        }
    }

    struct FreezeOutpoint(OutPoint);

    impl FrozenOutputs for FreezeOutpoint {
        fn is_frozen(&self, outpoint: &OutPoint, _height: i32) -> bool {
            *outpoint == self.0
        }
    }

    #[test]
    fn test_spend_then_disconnect_restores_coin() {
        let manager = manager();
        let mut builder = ChainBuilder::new(params());
        let a = builder.next_block(&[]);
        process(&manager, &a);
        let coin_op = OutPoint::new(a.transactions[0].txid(), 0);
        let original = manager.utxo().read_view().get(&coin_op).unwrap().unwrap();

        let b = builder.next_block(&[spend(coin_op, 10)]);
        process(&manager, &b);
        assert!(!manager.utxo().read_view().have(&coin_op).unwrap());

        manager.invalidate_block(&b.hash()).unwrap();
        assert_eq!(manager.tip().unwrap().hash(), a.hash());
        let view = manager.utxo().read_view();
        assert_eq!(view.get(&coin_op).unwrap(), Some(original));
        let spent_output = OutPoint::new(b.transactions[1].txid(), 0);
        assert!(!view.have(&spent_output).unwrap());
    }

    #[test]
    fn test_more_work_branch_wins_and_mempool_order() {
        let mempool = Arc::new(RecordingMempool::default());
        let manager = manager_with(
            ChainConfig::default(),
            Collaborators {
                mempool: mempool.clone(),
                ..Collaborators::default()
            },
        );
        let mut main_branch = ChainBuilder::new(params());
        let a1 = main_branch.next_block(&[]);
        process(&manager, &a1);
        let a2 = main_branch.next_block(&[spend(OutPoint::new(a1.transactions[0].txid(), 0), 5)]);
        process(&manager, &a2);

        let mut side = ChainBuilder::fork(params(), a1.hash(), 1, 7);
        let b2 = side.next_block(&[]);
        let b3 = side.next_block(&[]);
        process(&manager, &b2);
        assert_eq!(manager.tip().unwrap().hash(), a2.hash());
        mempool.events.lock().clear();

        process(&manager, &b3);
        assert_eq!(manager.tip().unwrap().hash(), b3.hash());
        assert_eq!(
            *mempool.events.lock(),
            vec!["return 1".to_string(), "remove 1".into(), "remove 1".into()]
        );
    }

    #[test]
    fn test_equal_work_keeps_first_validated() {
        let manager = manager();
        let a = ChainBuilder::new(params()).next_block(&[]);
        let a_prime = ChainBuilder::fork(params(), params().genesis_hash(), 0, 3).next_block(&[]);
        process(&manager, &a);
        process(&manager, &a_prime);
        assert_eq!(manager.tip().unwrap().hash(), a.hash());
    }

    #[test]
    fn test_invalid_script_marks_block_failed() {
        let manager = manager_with(
            ChainConfig::default(),
            Collaborators {
                scripts: Arc::new(RejectScript(vec![0xde, 0xad])),
                ..Collaborators::default()
            },
        );
        let mut builder = ChainBuilder::new(params());
        let a = builder.next_block(&[]);
        process(&manager, &a);
        let mut bad = spend(OutPoint::new(a.transactions[0].txid(), 0), 1);
        bad.inputs[0].script_sig = vec![0xde, 0xad];
        let b = builder.next_block(&[bad]);
        let c = builder.next_block(&[]);
        manager.accept_block(&b).unwrap();
        manager.accept_block(&c).unwrap();
        manager
            .activate_best_chain(&CancellationToken::new())
            .unwrap();
        assert!(manager.get_descriptor(&c.hash()).unwrap().is_failed_parent());

        let err = manager
            .process_block(&b, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(
            err.rejection().unwrap().reason(),
            "mandatory-script-verify-flag-failed"
        );
        assert_eq!(manager.tip().unwrap().hash(), a.hash());
        assert!(manager.get_descriptor(&b.hash()).unwrap().is_failed());
        assert!(!manager.is_aborted());
    }

    #[test]
    fn test_coinbase_overpay_rejected() {
        let manager = manager();
        let height = 1;
        let mut cb = crate::test_blocks::coinbase(height, 0, block_subsidy(height, &params()) + 1);
        cb.outputs.push(TxOut::new(0, vec![0x51]));
        let block = crate::test_blocks::mine(&params(), params().genesis_hash(), 1, vec![cb]);
        let err = manager
            .process_block(&block, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.rejection().unwrap().reason(), "bad-cb-amount");
        assert_eq!(manager.height(), 0);
    }

    #[test]
    fn test_missing_input_rejected_serially() {
        let manager = manager_with(
            ChainConfig {
                parallel_validation: false,
                ..ChainConfig::default()
            },
            Collaborators::default(),
        );
        let mut builder = ChainBuilder::new(params());
        let block = builder.next_block(&[spend(OutPoint::new(Hash256([4; 32]), 0), 1)]);
        let err = manager
            .process_block(&block, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(
            err.rejection().unwrap().reason(),
            "bad-txns-inputs-missingorspent"
        );
    }

    #[test]
    fn test_frozen_spend_freezes_block() {
        let mut builder = ChainBuilder::new(params());
        let a = builder.next_block(&[]);
        let frozen = OutPoint::new(a.transactions[0].txid(), 0);
        let manager = manager_with(
            ChainConfig::default(),
            Collaborators {
                frozen: Arc::new(FreezeOutpoint(frozen)),
                ..Collaborators::default()
            },
        );
        process(&manager, &a);
        let f = builder.next_block(&[spend(frozen, 1)]);
        process(&manager, &f);

        let f_desc = manager.get_descriptor(&f.hash()).unwrap();
        assert_eq!(manager.tip().unwrap().hash(), a.hash());
        assert!(f_desc.is_in_soft_consensus_freeze());
        assert!(!f_desc.is_invalid());

        // Extending past the freeze window makes the branch eligible.
        let mut tips = Vec::new();
        for _ in 0..4 {
            let block = builder.next_block(&[]);
            process(&manager, &block);
            tips.push(block.hash());
        }
        assert_eq!(manager.tip().unwrap().hash(), tips[3]);
        assert!(manager.is_on_active_chain(&f.hash()));
    }

    #[test]
    fn test_cancelled_activation() {
        let manager = manager();
        let block = ChainBuilder::new(params()).next_block(&[]);
        manager.accept_block(&block).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = manager.activate_best_chain(&cancel).unwrap();
        assert_eq!(outcome, crate::ActivateOutcome::Cancelled);
        assert_eq!(manager.height(), 0);
        let outcome = manager
            .activate_best_chain(&CancellationToken::new())
            .unwrap();
        assert_eq!(outcome, crate::ActivateOutcome::Completed);
        assert_eq!(manager.height(), 1);
    }
}
