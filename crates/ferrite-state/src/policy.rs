//! Soft rejection and soft consensus freeze.
//!
//! Both are windows measured in blocks. A block's effective window is
//! `max(own explicit value, parent's effective value - 1)`, floored at -1,
//! so the window shrinks by one per generation. A tip with an effective
//! window of zero or more is not eligible for selection.
//!
//! Soft rejection is an operator setting and its explicit value is
//! persisted. Freeze values live in memory only.

use crate::descriptor::BlockDescriptor;
use crate::tree::BlockTree;
use std::sync::Arc;
use tracing::debug;

/// Accessors for one kind of window.
struct Window {
    name: &'static str,
    explicit: fn(&BlockDescriptor) -> i32,
    effective: fn(&BlockDescriptor) -> i32,
    set_effective: fn(&BlockDescriptor, i32),
}

const SOFT_REJECT: Window = Window {
    name: "soft rejection",
    explicit: BlockDescriptor::soft_reject_explicit,
    effective: BlockDescriptor::soft_reject_effective,
    set_effective: BlockDescriptor::set_soft_reject_effective,
};

const FREEZE: Window = Window {
    name: "soft consensus freeze",
    explicit: BlockDescriptor::freeze_explicit,
    effective: BlockDescriptor::freeze_cumulative,
    set_effective: BlockDescriptor::set_freeze_cumulative,
};

fn combine(explicit: i32, parent_effective: i32) -> i32 {
    explicit.max(parent_effective - 1).max(-1)
}

impl Window {
    fn parent_effective(&self, tree: &BlockTree, desc: &BlockDescriptor) -> i32 {
        tree.parent(desc).map_or(-1, |p| (self.effective)(&p))
    }

    fn refresh(&self, tree: &BlockTree, desc: &BlockDescriptor) -> i32 {
        let value = combine((self.explicit)(desc), self.parent_effective(tree, desc));
        (self.set_effective)(desc, value);
        value
    }

    /// Recompute `desc` and every descendant its old or new window reaches.
    fn propagate(&self, tree: &BlockTree, desc: &Arc<BlockDescriptor>, old: i32) {
        let new = self.refresh(tree, desc);
        let reach = old.max(new);
        if reach <= 0 {
            return;
        }
        let affected = tree.descendants(desc, desc.height().saturating_add(reach));
        for child in &affected {
            self.refresh(tree, child);
        }
        debug!(
            hash = %desc.hash(),
            window = self.name,
            old,
            new,
            descendants = affected.len(),
            "Propagated window"
        );
    }

    fn recompute_all(&self, tree: &BlockTree) {
        let mut all = tree.snapshot();
        all.sort_by_key(|d| d.height());
        for desc in &all {
            self.refresh(tree, desc);
        }
    }
}

/// Mark `desc` soft rejected for `blocks` more blocks (-1 clears it) and
/// recompute the effective window of every affected descendant.
pub fn set_soft_rejection(tree: &BlockTree, desc: &Arc<BlockDescriptor>, blocks: i32) {
    let old = desc.soft_reject_effective();
    desc.set_soft_reject_explicit(blocks.max(-1));
    SOFT_REJECT.propagate(tree, desc, old);
}

/// Freeze `desc` and its descendants up to `blocks` generations below it.
pub fn apply_soft_consensus_freeze(tree: &BlockTree, desc: &Arc<BlockDescriptor>, blocks: i32) {
    let old = desc.freeze_cumulative();
    desc.set_freeze_explicit(blocks.max(-1));
    FREEZE.propagate(tree, desc, old);
}

/// Recompute every effective soft-rejection window from the explicit
/// values. Used after loading the block index.
pub fn recompute_soft_rejection(tree: &BlockTree) {
    SOFT_REJECT.recompute_all(tree);
}
