//! Chain tip selection.
//!
//! Candidates are ordered by:
//! 1. more chain work,
//! 2. earlier validation completion,
//! 3. lower arrival sequence id,
//! 4. lower block hash.
//!
//! The last key only separates blocks that are otherwise indistinguishable,
//! which in practice means two blocks loaded fresh from storage.

use crate::chain::Chain;
use crate::descriptor::{BlockDescriptor, BlockHandle, BlockValidity, ValidationTime};
use crate::tree::BlockTree;
use ferrite_consensus::Hash256;
use num_bigint::BigUint;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Snapshot of the ordering fields of one candidate. Greater is better.
#[derive(Debug, Clone)]
pub struct CandidateKey {
    pub work: BigUint,
    pub validation_time: ValidationTime,
    pub sequence_id: i64,
    pub hash: Hash256,
    pub handle: BlockHandle,
}

impl CandidateKey {
    pub fn of(desc: &BlockDescriptor) -> Self {
        let (validation_time, sequence_id) = desc.selection_fields();
        Self {
            work: desc.chain_work().clone(),
            validation_time,
            sequence_id,
            hash: desc.hash(),
            handle: desc.handle(),
        }
    }
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.work
            .cmp(&other.work)
            .then_with(|| other.validation_time.cmp(&self.validation_time))
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CandidateKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CandidateKey {}

/// Compare two tips; `Greater` means `a` is the better tip.
pub fn compare_tips(a: &BlockDescriptor, b: &BlockDescriptor) -> Ordering {
    CandidateKey::of(a).cmp(&CandidateKey::of(b))
}

enum PathCheck {
    Usable,
    /// A block on the path is being validated by another caller.
    Busy,
    /// The path is unusable at `at`.
    Broken {
        at: Arc<BlockDescriptor>,
        invalid: bool,
    },
}

/// Candidate set plus blocks waiting on missing ancestor data.
#[derive(Debug, Default)]
pub struct ChainSelector {
    candidates: BTreeSet<CandidateKey>,
    keys: HashMap<BlockHandle, CandidateKey>,
    unlinked: HashMap<BlockHandle, Vec<BlockHandle>>,
}

impl ChainSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn contains(&self, handle: BlockHandle) -> bool {
        self.keys.contains_key(&handle)
    }

    /// Candidate handles, best first.
    pub fn handles(&self) -> Vec<BlockHandle> {
        self.candidates.iter().rev().map(|k| k.handle).collect()
    }

    fn insert(&mut self, desc: &BlockDescriptor) {
        let key = CandidateKey::of(desc);
        if let Some(old) = self.keys.insert(desc.handle(), key.clone()) {
            self.candidates.remove(&old);
        }
        self.candidates.insert(key);
    }

    /// Offer `desc` as a candidate. Accepted when it is transactions-valid,
    /// linked, and not worse than `tip`.
    pub fn try_add(&mut self, desc: &BlockDescriptor, tip: Option<&BlockDescriptor>) -> bool {
        if !desc.is_valid(BlockValidity::Transactions) || !desc.is_linked() {
            return false;
        }
        if let Some(tip) = tip {
            if compare_tips(desc, tip) == Ordering::Less {
                return false;
            }
        }
        self.insert(desc);
        true
    }

    /// Insert without comparing to the tip.
    pub(crate) fn force_add(&mut self, desc: &BlockDescriptor) {
        self.insert(desc);
    }

    pub fn remove(&mut self, handle: BlockHandle) -> bool {
        match self.keys.remove(&handle) {
            Some(key) => self.candidates.remove(&key),
            None => false,
        }
    }

    /// Re-read the ordering fields of `desc` if it is a candidate.
    pub fn rekey(&mut self, desc: &BlockDescriptor) {
        if self.contains(desc.handle()) {
            self.insert(desc);
        }
    }

    /// Drop every candidate worse than `tip`. Deferred while the tip is
    /// frozen, since a later reorg may have to fall back to one of them.
    pub fn prune(&mut self, tip: &BlockDescriptor) -> usize {
        if tip.is_in_soft_consensus_freeze() {
            trace!(tip = %tip.hash(), "Tip is frozen, candidate pruning deferred");
            return 0;
        }
        let tip_key = CandidateKey::of(tip);
        let worse: Vec<CandidateKey> = self.candidates.range(..tip_key).cloned().collect();
        for key in &worse {
            self.candidates.remove(key);
            self.keys.remove(&key.handle);
        }
        worse.len()
    }

    /// Repopulate from every eligible descriptor in the tree.
    pub fn rebuild(&mut self, tree: &BlockTree, tip: Option<&BlockDescriptor>) {
        self.candidates.clear();
        self.keys.clear();
        tree.for_each(|desc| {
            if !desc.is_invalid() {
                self.try_add(desc, tip);
            }
        });
        if let Some(tip) = tip {
            self.try_add(tip, None);
        }
        debug!(candidates = self.candidates.len(), "Rebuilt candidate set");
    }

    /// Remember that `child` has data but waits on `parent`.
    pub fn add_unlinked(&mut self, parent: BlockHandle, child: BlockHandle) {
        let waiting = self.unlinked.entry(parent).or_default();
        if !waiting.contains(&child) {
            waiting.push(child);
        }
    }

    /// Blocks that were waiting on `parent`.
    pub fn take_unlinked(&mut self, parent: BlockHandle) -> Vec<BlockHandle> {
        self.unlinked.remove(&parent).unwrap_or_default()
    }

    pub fn unlinked_len(&self) -> usize {
        self.unlinked.values().map(Vec::len).sum()
    }

    pub fn clear_unlinked(&mut self) {
        self.unlinked.clear();
    }

    /// Best usable candidate.
    ///
    /// Soft-rejected and frozen tips, tips whose path is being validated
    /// elsewhere, and tips in `in_flight` are skipped but kept. Branches
    /// with an invalid ancestor are marked failed-by-parent and dropped;
    /// branches missing data are dropped and remembered as unlinked.
    pub fn find_best(
        &mut self,
        tree: &BlockTree,
        chain: &Chain,
        in_flight: &HashSet<BlockHandle>,
    ) -> Option<Arc<BlockDescriptor>> {
        loop {
            let mut broken = None;
            for key in self.candidates.iter().rev() {
                let Some(desc) = tree.get_by_handle(key.handle) else {
                    continue;
                };
                if desc.is_soft_rejected() || desc.is_in_soft_consensus_freeze() {
                    trace!(hash = %desc.hash(), "Skipping ineligible candidate");
                    continue;
                }
                if in_flight.contains(&desc.handle()) {
                    continue;
                }
                match Self::check_path(tree, chain, &desc, in_flight) {
                    PathCheck::Usable => return Some(desc),
                    PathCheck::Busy => continue,
                    PathCheck::Broken { at, invalid } => {
                        broken = Some((desc, at, invalid));
                        break;
                    }
                }
            }

            let (candidate, at, invalid) = broken?;
            self.drop_branch(tree, &candidate, &at, invalid);
        }
    }

    fn check_path(
        tree: &BlockTree,
        chain: &Chain,
        candidate: &Arc<BlockDescriptor>,
        in_flight: &HashSet<BlockHandle>,
    ) -> PathCheck {
        let mut walk = Some(Arc::clone(candidate));
        while let Some(desc) = walk {
            if chain.contains(&desc) {
                break;
            }
            if desc.is_invalid() {
                return PathCheck::Broken { at: desc, invalid: true };
            }
            if !desc.has_data() {
                return PathCheck::Broken { at: desc, invalid: false };
            }
            if in_flight.contains(&desc.handle()) {
                return PathCheck::Busy;
            }
            walk = tree.parent(&desc);
        }
        PathCheck::Usable
    }

    fn drop_branch(
        &mut self,
        tree: &BlockTree,
        candidate: &Arc<BlockDescriptor>,
        at: &Arc<BlockDescriptor>,
        invalid: bool,
    ) {
        debug!(
            candidate = %candidate.hash(),
            at = %at.hash(),
            invalid,
            "Dropping unusable candidate branch"
        );
        let mut walk = Some(Arc::clone(candidate));
        while let Some(desc) = walk {
            if desc.handle() == at.handle() {
                break;
            }
            if invalid {
                desc.mark_failed_parent();
            } else if let Some(parent) = desc.parent_handle() {
                self.add_unlinked(parent, desc.handle());
            }
            self.remove(desc.handle());
            walk = tree.parent(&desc);
        }
        self.remove(at.handle());
    }
}
