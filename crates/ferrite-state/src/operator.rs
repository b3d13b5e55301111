//! Operator commands: invalidate, reconsider, prioritize, soft rejection
//! and explicit soft consensus freezes.

use crate::chain::Chain;
use crate::descriptor::{BlockDescriptor, BlockValidity, ValidationTime};
use crate::error::ChainResult;
use crate::manager::{ChainManager, FlushMode, MainState};
use crate::policy::{apply_soft_consensus_freeze, set_soft_rejection};
use crate::{StateError, StateResult};
use ferrite_consensus::Hash256;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

fn tip_is_ineligible(chain: &Chain) -> bool {
    chain.tip().map_or(false, |tip| {
        tip.parent_handle().is_some()
            && (tip.is_soft_rejected() || tip.is_in_soft_consensus_freeze())
    })
}

impl ChainManager {
    fn lookup(&self, hash: &Hash256) -> StateResult<Arc<BlockDescriptor>> {
        self.tree.get(hash).ok_or(StateError::UnknownBlock(*hash))
    }

    /// Re-run activation and make the outcome durable.
    fn settle(&self) -> StateResult<()> {
        let outcome = self.activate_inner(&CancellationToken::new())?;
        let _main = self.main.lock();
        self.flush_locked(FlushMode::Always)?;
        info!(?outcome, "Chain settled after operator change");
        Ok(())
    }

    /// Mark a block invalid and move the active chain off it.
    #[instrument(skip(self))]
    pub fn invalidate_block(&self, hash: &Hash256) -> ChainResult<()> {
        self.guarded(|| {
            {
                let mut main = self.main.lock();
                let desc = self.lookup(hash)?;
                if desc.parent_handle().is_none() {
                    return Err(StateError::InvalidRequest(
                        "the genesis block cannot be invalidated".into(),
                    )
                    .into());
                }
                desc.mark_failed();
                self.rewind(&mut main, |chain| chain.contains(&desc), None)?;

                let main = &mut *main;
                main.selector.remove(desc.handle());
                for child in self.tree.descendants(&desc, i32::MAX) {
                    child.mark_failed_parent();
                }
                let tip = main.tip();
                main.selector.rebuild(&self.tree, tip.as_deref());
                info!(hash = %hash, height = desc.height(), "Block invalidated by operator");
            }
            Ok(self.settle()?)
        })
    }

    /// Clear the failure flags of a block, its ancestors and its
    /// descendants, and reconsider them for the active chain.
    #[instrument(skip(self))]
    pub fn reconsider_block(&self, hash: &Hash256) -> ChainResult<()> {
        self.guarded(|| {
            {
                let mut main = self.main.lock();
                let desc = self.lookup(hash)?;

                let mut affected = self.tree.descendants(&desc, i32::MAX);
                let mut walk = Some(Arc::clone(&desc));
                while let Some(d) = walk {
                    walk = self.tree.parent(&d);
                    affected.push(d);
                }

                let mut cleared = 0usize;
                for d in &affected {
                    if d.clear_failure() {
                        main.rejections.remove(&d.handle());
                        cleared += 1;
                    }
                }
                let tip = main.tip();
                main.selector.rebuild(&self.tree, tip.as_deref());
                info!(hash = %hash, cleared, "Block reconsidered by operator");
            }
            Ok(self.settle()?)
        })
    }

    /// Treat a block as if it had arrived before every other block of equal
    /// work ("precious").
    #[instrument(skip(self))]
    pub fn prioritize_block(&self, hash: &Hash256) -> ChainResult<()> {
        self.guarded(|| {
            {
                let mut guard = self.main.lock();
                let main: &mut MainState = &mut guard;
                let desc = self.lookup(hash)?;

                if let Some(tip) = main.tip() {
                    if desc.chain_work() < tip.chain_work() {
                        return Ok(());
                    }
                    if *tip.chain_work() > main.last_precious_work {
                        main.precious_counter = -1;
                    }
                    main.last_precious_work = tip.chain_work().clone();
                }

                main.selector.remove(desc.handle());
                desc.set_sequence_id(main.precious_counter);
                main.precious_counter = main.precious_counter.saturating_sub(1);
                desc.set_validation_time(ValidationTime::Earliest);
                if desc.is_valid(BlockValidity::Transactions) && desc.is_linked() {
                    main.selector.force_add(&desc);
                    if let Some(tip) = main.tip() {
                        main.selector.prune(&tip);
                    }
                }
                info!(
                    hash = %hash,
                    sequence_id = desc.sequence_id(),
                    "Block prioritized by operator"
                );
            }
            Ok(self.settle()?)
        })
    }

    /// Soft reject `hash` for `blocks` further blocks; -1 clears the
    /// block's own rejection.
    #[instrument(skip(self))]
    pub fn set_soft_rejected_for(&self, hash: &Hash256, blocks: i32) -> ChainResult<()> {
        self.guarded(|| {
            {
                let mut main = self.main.lock();
                let desc = self.lookup(hash)?;
                set_soft_rejection(&self.tree, &desc, blocks);
                self.retreat_from_ineligible_tip(&mut main)?;
                info!(
                    hash = %hash,
                    blocks,
                    effective = desc.soft_reject_effective(),
                    "Soft rejection updated by operator"
                );
            }
            Ok(self.settle()?)
        })
    }

    /// Freeze `hash` and its descendants up to `blocks` generations down.
    #[instrument(skip(self))]
    pub fn soft_consensus_freeze(&self, hash: &Hash256, blocks: i32) -> ChainResult<()> {
        self.guarded(|| {
            {
                let mut main = self.main.lock();
                let desc = self.lookup(hash)?;
                apply_soft_consensus_freeze(&self.tree, &desc, blocks);
                self.retreat_from_ineligible_tip(&mut main)?;
                info!(hash = %hash, blocks, "Soft consensus freeze applied by operator");
            }
            Ok(self.activate_inner(&CancellationToken::new()).map(|_| ())?)
        })
    }

    /// Disconnect while the tip is soft rejected or frozen, then rebuild
    /// the candidate set around the new tip.
    fn retreat_from_ineligible_tip(&self, main: &mut MainState) -> StateResult<()> {
        self.rewind(main, tip_is_ineligible, None)?;
        let tip = main.tip();
        main.selector.rebuild(&self.tree, tip.as_deref());
        Ok(())
    }
}
