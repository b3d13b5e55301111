//! Block descriptors.
//!
//! A descriptor is the in-memory record of one block's place in the tree.
//! Identity, header, height and chain work are fixed at creation. Everything
//! else lives in a pool of sharded locks shared by every descriptor of a
//! tree, so a descriptor costs no lock of its own. Two unrelated descriptors
//! may contend on the same shard; critical sections are a few field reads.
//!
//! Mutators that touch persisted fields record the descriptor in the tree's
//! dirty set. Derived fields (chain-tx, sequence id, validation time,
//! effective soft rejection, freeze values) change silently.

use bitflags::bitflags;
use ferrite_consensus::{BlockHeader, Hash256};
use ferrite_storage::FilePos;
use num_bigint::BigUint;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Number of lock shards per tree.
pub const LOCK_POOL_SIZE: usize = 64;

/// Stable index of a descriptor inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle(u32);

impl BlockHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Progressive validation levels.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockValidity {
    Unknown = 0,
    /// Header parsed, proof of work checked.
    Header = 1,
    /// Parent known and linked.
    Tree = 2,
    /// Block data present and structurally valid.
    Transactions = 3,
    /// Inputs exist and are unspent, amounts balance.
    Chain = 4,
    /// Scripts verified.
    Scripts = 5,
}

impl BlockValidity {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => BlockValidity::Unknown,
            1 => BlockValidity::Header,
            2 => BlockValidity::Tree,
            3 => BlockValidity::Transactions,
            4 => BlockValidity::Chain,
            5 => BlockValidity::Scripts,
            _ => return None,
        })
    }
}

bitflags! {
    /// Independent status flags. Only reachable through descriptor methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BlockStatus: u8 {
        const HAVE_DATA = 1 << 0;
        const HAVE_UNDO = 1 << 1;
        const FAILED = 1 << 2;
        const FAILED_PARENT = 1 << 3;
        const HAVE_DISK_META = 1 << 4;
    }
}

/// When validation of a block completed.
///
/// Orders as `Earliest < At(_) < Never`, so prioritized blocks beat every
/// validated block and unvalidated ones lose to all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationTime {
    Earliest,
    At(Instant),
    Never,
}

/// Mutable part of a descriptor.
#[derive(Debug, Clone)]
pub(crate) struct DescriptorState {
    pub(crate) validity: BlockValidity,
    pub(crate) status: BlockStatus,
    pub(crate) data_pos: Option<FilePos>,
    pub(crate) undo_pos: Option<FilePos>,
    pub(crate) disk_size: u32,
    pub(crate) tx_count: u32,
    pub(crate) chain_tx: u64,
    pub(crate) sequence_id: i64,
    pub(crate) validation_time: ValidationTime,
    pub(crate) soft_reject_explicit: i32,
    pub(crate) soft_reject_effective: i32,
    pub(crate) freeze_explicit: i32,
    pub(crate) freeze_cumulative: i32,
}

impl Default for DescriptorState {
    fn default() -> Self {
        Self {
            validity: BlockValidity::Unknown,
            status: BlockStatus::empty(),
            data_pos: None,
            undo_pos: None,
            disk_size: 0,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
            validation_time: ValidationTime::Never,
            soft_reject_explicit: -1,
            soft_reject_effective: -1,
            freeze_explicit: -1,
            freeze_cumulative: -1,
        }
    }
}

/// Lock pool and dirty set shared by all descriptors of one tree.
pub(crate) struct DescriptorShared {
    shards: Vec<Mutex<Vec<DescriptorState>>>,
    dirty: Mutex<HashSet<BlockHandle>>,
}

impl DescriptorShared {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..LOCK_POOL_SIZE).map(|_| Mutex::new(Vec::new())).collect(),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Store the state for a freshly allocated handle. Handles must be
    /// pushed in allocation order.
    pub(crate) fn push(&self, handle: BlockHandle, state: DescriptorState) {
        let mut shard = self.shards[handle.index() % LOCK_POOL_SIZE].lock();
        debug_assert_eq!(shard.len(), handle.index() / LOCK_POOL_SIZE);
        shard.push(state);
    }

    fn lock(&self, handle: BlockHandle) -> MappedMutexGuard<'_, DescriptorState> {
        let slot = handle.index() / LOCK_POOL_SIZE;
        MutexGuard::map(self.shards[handle.index() % LOCK_POOL_SIZE].lock(), |shard| {
            &mut shard[slot]
        })
    }

    fn mark_dirty(&self, handle: BlockHandle) {
        self.dirty.lock().insert(handle);
    }

    pub(crate) fn extract_dirty(&self) -> Vec<BlockHandle> {
        let mut handles: Vec<_> = std::mem::take(&mut *self.dirty.lock()).into_iter().collect();
        handles.sort_unstable();
        handles
    }

    pub(crate) fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }
}

/// One block's position in the tree.
pub struct BlockDescriptor {
    handle: BlockHandle,
    hash: Hash256,
    header: BlockHeader,
    height: i32,
    chain_work: BigUint,
    parent: Option<BlockHandle>,
    skip: Option<BlockHandle>,
    shared: Arc<DescriptorShared>,
}

impl fmt::Debug for BlockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDescriptor")
            .field("hash", &self.hash)
            .field("height", &self.height)
            .field("validity", &self.validity())
            .finish()
    }
}

impl PartialEq for BlockDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for BlockDescriptor {}

impl BlockDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: BlockHandle,
        hash: Hash256,
        header: BlockHeader,
        height: i32,
        chain_work: BigUint,
        parent: Option<BlockHandle>,
        skip: Option<BlockHandle>,
        shared: Arc<DescriptorShared>,
    ) -> Self {
        Self {
            handle,
            hash,
            header,
            height,
            chain_work,
            parent,
            skip,
            shared,
        }
    }

    pub fn handle(&self) -> BlockHandle {
        self.handle
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Cumulative work up to and including this block.
    pub fn chain_work(&self) -> &BigUint {
        &self.chain_work
    }

    pub fn parent_handle(&self) -> Option<BlockHandle> {
        self.parent
    }

    pub(crate) fn skip_handle(&self) -> Option<BlockHandle> {
        self.skip
    }

    fn state(&self) -> MappedMutexGuard<'_, DescriptorState> {
        self.shared.lock(self.handle)
    }

    /// Mutate persisted fields; the descriptor becomes dirty if `f` says so.
    fn update(&self, f: impl FnOnce(&mut DescriptorState) -> bool) -> bool {
        let changed = f(&mut self.state());
        if changed {
            self.shared.mark_dirty(self.handle);
        }
        changed
    }

    pub(crate) fn touch(&self) {
        self.shared.mark_dirty(self.handle);
    }

    pub(crate) fn state_snapshot(&self) -> DescriptorState {
        self.state().clone()
    }

    // Validity and status.

    pub fn validity(&self) -> BlockValidity {
        self.state().validity
    }

    /// At least `level` and not failed.
    pub fn is_valid(&self, level: BlockValidity) -> bool {
        let state = self.state();
        !state
            .status
            .intersects(BlockStatus::FAILED | BlockStatus::FAILED_PARENT)
            && state.validity >= level
    }

    /// Raise the validity level. Never lowers it and never raises a failed
    /// block; returns whether anything changed.
    pub(crate) fn raise_validity(&self, level: BlockValidity) -> bool {
        self.update(|s| {
            if s.status
                .intersects(BlockStatus::FAILED | BlockStatus::FAILED_PARENT)
                || s.validity >= level
            {
                return false;
            }
            s.validity = level;
            true
        })
    }

    pub fn has_data(&self) -> bool {
        self.state().status.contains(BlockStatus::HAVE_DATA)
    }

    pub fn has_undo(&self) -> bool {
        self.state().status.contains(BlockStatus::HAVE_UNDO)
    }

    pub fn has_disk_meta(&self) -> bool {
        self.state().status.contains(BlockStatus::HAVE_DISK_META)
    }

    /// Failed validation itself.
    pub fn is_failed(&self) -> bool {
        self.state().status.contains(BlockStatus::FAILED)
    }

    /// Descends from a failed block.
    pub fn is_failed_parent(&self) -> bool {
        self.state().status.contains(BlockStatus::FAILED_PARENT)
    }

    /// Failed or descends from a failed block.
    pub fn is_invalid(&self) -> bool {
        self.state()
            .status
            .intersects(BlockStatus::FAILED | BlockStatus::FAILED_PARENT)
    }

    pub(crate) fn mark_failed(&self) -> bool {
        self.update(|s| {
            if s.status.contains(BlockStatus::FAILED) {
                return false;
            }
            s.status.insert(BlockStatus::FAILED);
            true
        })
    }

    pub(crate) fn mark_failed_parent(&self) -> bool {
        self.update(|s| {
            if s.status
                .intersects(BlockStatus::FAILED | BlockStatus::FAILED_PARENT)
            {
                return false;
            }
            s.status.insert(BlockStatus::FAILED_PARENT);
            true
        })
    }

    /// The explicit "clear failure" operation.
    pub(crate) fn clear_failure(&self) -> bool {
        self.update(|s| {
            if !s
                .status
                .intersects(BlockStatus::FAILED | BlockStatus::FAILED_PARENT)
            {
                return false;
            }
            s.status
                .remove(BlockStatus::FAILED | BlockStatus::FAILED_PARENT);
            true
        })
    }

    // Disk location.

    pub fn data_pos(&self) -> Option<FilePos> {
        self.state().data_pos
    }

    pub fn undo_pos(&self) -> Option<FilePos> {
        self.state().undo_pos
    }

    /// Serialized block size recorded with the data position.
    pub fn disk_size(&self) -> u32 {
        self.state().disk_size
    }

    pub fn tx_count(&self) -> u32 {
        self.state().tx_count
    }

    /// Record where the block data was written.
    pub(crate) fn set_block_data(&self, pos: FilePos, size: u32, tx_count: u32) {
        self.update(|s| {
            s.data_pos = Some(pos);
            s.disk_size = size;
            s.tx_count = tx_count;
            s.status
                .insert(BlockStatus::HAVE_DATA | BlockStatus::HAVE_DISK_META);
            true
        });
    }

    pub(crate) fn set_undo_pos(&self, pos: FilePos) {
        self.update(|s| {
            s.undo_pos = Some(pos);
            s.status.insert(BlockStatus::HAVE_UNDO);
            true
        });
    }

    // Derived, memory-only fields.

    /// Transactions in the chain up to and including this block; zero until
    /// every ancestor has block data.
    pub fn chain_tx(&self) -> u64 {
        self.state().chain_tx
    }

    pub fn is_linked(&self) -> bool {
        self.chain_tx() > 0
    }

    pub(crate) fn set_chain_tx(&self, chain_tx: u64) {
        self.state().chain_tx = chain_tx;
    }

    pub fn sequence_id(&self) -> i64 {
        self.state().sequence_id
    }

    pub(crate) fn set_sequence_id(&self, id: i64) {
        self.state().sequence_id = id;
    }

    pub fn validation_time(&self) -> ValidationTime {
        self.state().validation_time
    }

    pub(crate) fn set_validation_time(&self, time: ValidationTime) {
        self.state().validation_time = time;
    }

    /// Record completion of validation unless the block was prioritized.
    pub(crate) fn mark_validated(&self, at: Instant) {
        let mut state = self.state();
        if state.validation_time == ValidationTime::Never {
            state.validation_time = ValidationTime::At(at);
        }
    }

    /// Ordering inputs for the candidate set, read under one lock.
    pub(crate) fn selection_fields(&self) -> (ValidationTime, i64) {
        let state = self.state();
        (state.validation_time, state.sequence_id)
    }

    // Soft rejection.

    /// Operator-set window, -1 when unset. Persisted.
    pub fn soft_reject_explicit(&self) -> i32 {
        self.state().soft_reject_explicit
    }

    /// Window after propagation from ancestors, -1 when not rejected.
    pub fn soft_reject_effective(&self) -> i32 {
        self.state().soft_reject_effective
    }

    pub fn is_soft_rejected(&self) -> bool {
        self.soft_reject_effective() >= 0
    }

    pub(crate) fn set_soft_reject_explicit(&self, n: i32) -> bool {
        self.update(|s| {
            if s.soft_reject_explicit == n {
                return false;
            }
            s.soft_reject_explicit = n;
            true
        })
    }

    pub(crate) fn set_soft_reject_effective(&self, n: i32) {
        self.state().soft_reject_effective = n;
    }

    // Soft consensus freeze.

    pub fn freeze_explicit(&self) -> i32 {
        self.state().freeze_explicit
    }

    pub fn freeze_cumulative(&self) -> i32 {
        self.state().freeze_cumulative
    }

    /// Ineligible as a chain tip while its cumulative freeze is running.
    pub fn is_in_soft_consensus_freeze(&self) -> bool {
        self.freeze_cumulative() >= 0
    }

    pub(crate) fn set_freeze_explicit(&self, n: i32) {
        self.state().freeze_explicit = n;
    }

    pub(crate) fn set_freeze_cumulative(&self, n: i32) {
        self.state().freeze_cumulative = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_consensus::ChainParams;

    fn standalone() -> (Arc<DescriptorShared>, BlockDescriptor) {
        let shared = Arc::new(DescriptorShared::new());
        let header = ChainParams::regtest().genesis_block().header;
        let handle = BlockHandle::new(0);
        shared.push(handle, DescriptorState::default());
        let desc = BlockDescriptor::new(
            handle,
            header.hash(),
            header,
            0,
            BigUint::from(2u32),
            None,
            None,
            Arc::clone(&shared),
        );
        (shared, desc)
    }

    #[test]
    fn test_validity_is_monotonic() {
        let (_, desc) = standalone();
        assert!(desc.raise_validity(BlockValidity::Transactions));
        assert!(!desc.raise_validity(BlockValidity::Tree));
        assert_eq!(desc.validity(), BlockValidity::Transactions);
        assert!(desc.is_valid(BlockValidity::Tree));
        assert!(!desc.is_valid(BlockValidity::Scripts));
    }

    #[test]
    fn test_failed_block_is_not_raised() {
        let (_, desc) = standalone();
        desc.raise_validity(BlockValidity::Tree);
        assert!(desc.mark_failed());
        assert!(!desc.raise_validity(BlockValidity::Scripts));
        assert!(!desc.is_valid(BlockValidity::Header));
        assert!(desc.clear_failure());
        assert!(desc.is_valid(BlockValidity::Tree));
    }

    #[test]
    fn test_persisted_mutations_mark_dirty() {
        let (shared, desc) = standalone();
        desc.set_chain_tx(5);
        desc.set_freeze_cumulative(3);
        assert_eq!(shared.dirty_len(), 0);

        desc.set_soft_reject_explicit(2);
        assert_eq!(shared.extract_dirty(), vec![desc.handle()]);
        assert_eq!(shared.dirty_len(), 0);

        // Setting the same value again is not a change.
        assert!(!desc.set_soft_reject_explicit(2));
        assert_eq!(shared.dirty_len(), 0);
    }

    #[test]
    fn test_validation_time_order() {
        let now = Instant::now();
        assert!(ValidationTime::Earliest < ValidationTime::At(now));
        assert!(ValidationTime::At(now) < ValidationTime::Never);

        let (_, desc) = standalone();
        desc.set_validation_time(ValidationTime::Earliest);
        desc.mark_validated(now);
        assert_eq!(desc.validation_time(), ValidationTime::Earliest);
    }
}
