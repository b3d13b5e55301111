//! The block tree.
//!
//! Owns every [`BlockDescriptor`] in an append-only arena addressed by
//! [`BlockHandle`]. Parents are stored as handles; children are never stored
//! and are derived on demand by [`BlockTree::descendants`].

use crate::descriptor::{
    BlockDescriptor, BlockHandle, BlockValidity, DescriptorShared, DescriptorState,
};
use crate::{StateError, StateResult};
use ferrite_consensus::{block_proof, BlockHeader, Hash256};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Result of [`BlockTree::insert`].
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    New(Arc<BlockDescriptor>),
    Existing(Arc<BlockDescriptor>),
}

impl InsertOutcome {
    pub fn descriptor(&self) -> &Arc<BlockDescriptor> {
        match self {
            InsertOutcome::New(desc) | InsertOutcome::Existing(desc) => desc,
        }
    }

    pub fn into_descriptor(self) -> Arc<BlockDescriptor> {
        match self {
            InsertOutcome::New(desc) | InsertOutcome::Existing(desc) => desc,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::New(_))
    }
}

#[derive(Default)]
struct Arena {
    descriptors: Vec<Arc<BlockDescriptor>>,
    by_hash: HashMap<Hash256, BlockHandle>,
}

impl Arena {
    fn get(&self, handle: BlockHandle) -> Option<&Arc<BlockDescriptor>> {
        self.descriptors.get(handle.index())
    }

    fn parent_of(&self, desc: &BlockDescriptor) -> Option<&Arc<BlockDescriptor>> {
        desc.parent_handle().and_then(|h| self.get(h))
    }

    fn skip_of(&self, desc: &BlockDescriptor) -> Option<&Arc<BlockDescriptor>> {
        desc.skip_handle().and_then(|h| self.get(h))
    }

    /// Greedy skip-list walk.
    fn ancestor<'a>(
        &'a self,
        mut walk: &'a Arc<BlockDescriptor>,
        height: i32,
    ) -> Option<&'a Arc<BlockDescriptor>> {
        if height < 0 || height > walk.height() {
            return None;
        }
        let mut walk_height = walk.height();
        while walk_height > height {
            let skip_h = skip_height(walk_height);
            let skip_prev_h = skip_height(walk_height - 1);
            let take_skip = match self.skip_of(walk) {
                Some(_) => {
                    skip_h == height
                        || (skip_h > height
                            && !(skip_prev_h < skip_h - 2 && skip_prev_h >= height))
                }
                None => false,
            };
            if take_skip {
                walk = self.skip_of(walk)?;
                walk_height = skip_h;
            } else {
                walk = self.parent_of(walk)?;
                walk_height -= 1;
            }
        }
        Some(walk)
    }
}

/// Clear the lowest set bit.
fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

/// Height the skip pointer of a block at `height` points to.
pub(crate) fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Arena of block descriptors with hash lookup and dirty tracking.
pub struct BlockTree {
    arena: RwLock<Arena>,
    shared: Arc<DescriptorShared>,
    genesis_hash: Hash256,
    next_sequence: AtomicI64,
}

impl BlockTree {
    /// Empty tree that will accept a parentless header only for
    /// `genesis_hash`.
    pub fn new(genesis_hash: Hash256) -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            shared: Arc::new(DescriptorShared::new()),
            genesis_hash,
            next_sequence: AtomicI64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.read().descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, hash: &Hash256) -> Option<Arc<BlockDescriptor>> {
        let arena = self.arena.read();
        arena
            .by_hash
            .get(hash)
            .and_then(|h| arena.get(*h))
            .cloned()
    }

    pub fn get_by_handle(&self, handle: BlockHandle) -> Option<Arc<BlockDescriptor>> {
        self.arena.read().get(handle).cloned()
    }

    pub fn genesis(&self) -> Option<Arc<BlockDescriptor>> {
        self.get(&self.genesis_hash)
    }

    pub fn parent(&self, desc: &BlockDescriptor) -> Option<Arc<BlockDescriptor>> {
        desc.parent_handle().and_then(|h| self.get_by_handle(h))
    }

    /// Insert a newly received header at tree-linked validity.
    ///
    /// Derived policy fields are inherited from the parent. The new
    /// descriptor is dirty.
    pub fn insert(&self, header: BlockHeader) -> StateResult<InsertOutcome> {
        self.insert_with(header, None, |parent| {
            let mut state = DescriptorState {
                validity: BlockValidity::Tree,
                ..DescriptorState::default()
            };
            if let Some(parent) = parent {
                state.soft_reject_effective = (parent.soft_reject_effective() - 1).max(-1);
                state.freeze_cumulative = (parent.freeze_cumulative() - 1).max(-1);
            }
            state
        })
    }

    /// Insert a descriptor loaded from storage. Only the persisted fields
    /// are taken from `state`; the caller recomputes derived ones.
    pub(crate) fn insert_loaded(
        &self,
        header: BlockHeader,
        height: i32,
        state: DescriptorState,
    ) -> StateResult<Arc<BlockDescriptor>> {
        match self.insert_with(header, Some(height), move |_| state)? {
            InsertOutcome::New(desc) => Ok(desc),
            InsertOutcome::Existing(desc) => Err(StateError::Corruption(format!(
                "duplicate block index record for {}",
                desc.hash()
            ))),
        }
    }

    fn insert_with(
        &self,
        header: BlockHeader,
        expected_height: Option<i32>,
        make_state: impl FnOnce(Option<&BlockDescriptor>) -> DescriptorState,
    ) -> StateResult<InsertOutcome> {
        let hash = header.hash();
        let mut arena = self.arena.write();
        if let Some(existing) = arena.by_hash.get(&hash).and_then(|h| arena.get(*h)) {
            return Ok(InsertOutcome::Existing(Arc::clone(existing)));
        }

        let parent = if header.prev_hash.is_zero() && hash == self.genesis_hash {
            None
        } else {
            let parent = arena
                .by_hash
                .get(&header.prev_hash)
                .and_then(|h| arena.get(*h))
                .ok_or(StateError::UnknownBlock(header.prev_hash))?;
            Some(Arc::clone(parent))
        };

        let proof = block_proof(header.bits);
        let (height, chain_work, skip) = match &parent {
            Some(parent) => {
                let height = parent.height() + 1;
                let skip = arena
                    .ancestor(parent, skip_height(height))
                    .map(|d| d.handle());
                (height, parent.chain_work() + proof, skip)
            }
            None => (0, proof, None),
        };
        if let Some(expected) = expected_height {
            if expected != height {
                return Err(StateError::Corruption(format!(
                    "block {} stored at height {} but links at {}",
                    hash, expected, height
                )));
            }
        }

        let handle = BlockHandle::new(arena.descriptors.len());
        let dirty = expected_height.is_none();
        self.shared.push(handle, make_state(parent.as_deref()));
        let desc = Arc::new(BlockDescriptor::new(
            handle,
            hash,
            header,
            height,
            chain_work,
            parent.map(|p| p.handle()),
            skip,
            Arc::clone(&self.shared),
        ));
        arena.descriptors.push(Arc::clone(&desc));
        arena.by_hash.insert(hash, handle);
        drop(arena);

        if dirty {
            self.mark_dirty(&desc);
        }
        Ok(InsertOutcome::New(desc))
    }

    /// Ancestor of `desc` at `height`; `None` outside `0..=desc.height()`.
    pub fn ancestor(&self, desc: &Arc<BlockDescriptor>, height: i32) -> Option<Arc<BlockDescriptor>> {
        self.arena.read().ancestor(desc, height).cloned()
    }

    /// Deepest block that is an ancestor of (or equal to) both.
    pub fn last_common_ancestor(
        &self,
        a: &Arc<BlockDescriptor>,
        b: &Arc<BlockDescriptor>,
    ) -> Option<Arc<BlockDescriptor>> {
        let arena = self.arena.read();
        let height = a.height().min(b.height());
        let mut a = arena.ancestor(a, height)?;
        let mut b = arena.ancestor(b, height)?;
        while a.handle() != b.handle() {
            a = arena.parent_of(a)?;
            b = arena.parent_of(b)?;
        }
        Some(Arc::clone(a))
    }

    /// Strict descendants of `root` up to `max_height` inclusive, parents
    /// before children.
    pub fn descendants(&self, root: &BlockDescriptor, max_height: i32) -> Vec<Arc<BlockDescriptor>> {
        let all = self.snapshot();
        let mut children: HashMap<BlockHandle, Vec<&Arc<BlockDescriptor>>> = HashMap::new();
        for desc in &all {
            if desc.height() > root.height() && desc.height() <= max_height {
                if let Some(parent) = desc.parent_handle() {
                    children.entry(parent).or_default().push(desc);
                }
            }
        }

        let mut out = Vec::new();
        let mut queue = VecDeque::from([root.handle()]);
        while let Some(handle) = queue.pop_front() {
            if let Some(kids) = children.remove(&handle) {
                for kid in kids {
                    queue.push_back(kid.handle());
                    out.push(Arc::clone(kid));
                }
            }
        }
        out
    }

    /// Copy of every descriptor, in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<BlockDescriptor>> {
        self.arena.read().descriptors.clone()
    }

    /// Visit every descriptor. The visitor runs without the arena lock, so
    /// it may insert or mutate descriptors; inserted ones are not visited.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<BlockDescriptor>)) {
        for desc in self.snapshot() {
            visitor(&desc);
        }
    }

    /// Record that `desc` needs persisting.
    pub fn mark_dirty(&self, desc: &BlockDescriptor) {
        desc.touch();
    }

    /// Take the dirty set.
    pub fn extract_dirty(&self) -> Vec<Arc<BlockDescriptor>> {
        let handles = self.shared.extract_dirty();
        let arena = self.arena.read();
        handles
            .into_iter()
            .filter_map(|h| arena.get(h).cloned())
            .collect()
    }

    /// Next arrival sequence id.
    pub(crate) fn next_sequence_id(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }
}
