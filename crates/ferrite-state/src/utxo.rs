//! Transactional UTXO set.
//!
//! Committed state (the coin cache plus the best-block pointer) sits behind
//! a write-preferring upgradable `RwLock`. Readers and spans hold the shared
//! side. A span collects its mutations privately and publishes them with
//! [`UtxoSpan::try_flush`], which takes the upgradable side, waits for the
//! other readers to drain, applies the batch and downgrades back to a read
//! lock. Only one caller may hold the upgradable side; a second span asking
//! for it is told it has been invalidated instead of blocking.
//!
//! Loaded entries are clean and may be dropped at any time. Entries written
//! by spans are dirty until [`UtxoSet::flush`] persists them together with
//! the best-block pointer in one storage batch.

use crate::coins::Coin;
use crate::{StateError, StateResult};
use ferrite_consensus::encoding::{deserialize, serialize};
use ferrite_consensus::{Hash256, OutPoint};
use ferrite_storage::{ColumnFamily, Storage, WriteBatch};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Metadata key of the best-block pointer.
pub const BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` marks a spent coin that has not been persisted yet.
    coin: Option<Coin>,
    dirty: bool,
}

impl CacheEntry {
    fn usage(&self) -> usize {
        self.coin
            .as_ref()
            .map_or(crate::coins::COIN_OVERHEAD, Coin::memory_usage)
    }
}

#[derive(Debug, Default)]
struct CoinCache {
    entries: HashMap<OutPoint, CacheEntry>,
    usage: usize,
}

impl CoinCache {
    fn insert(&mut self, outpoint: OutPoint, entry: CacheEntry) {
        self.usage += entry.usage();
        if let Some(old) = self.entries.insert(outpoint, entry) {
            self.usage -= old.usage();
        }
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<CacheEntry> {
        let entry = self.entries.remove(outpoint)?;
        self.usage -= entry.usage();
        Some(entry)
    }

    fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) {
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            let kept = keep(entry);
            if !kept {
                freed += entry.usage();
            }
            kept
        });
        self.usage -= freed;
    }
}

/// State guarded by the UTXO lock.
struct Committed {
    best_block: Hash256,
    cache: Mutex<CoinCache>,
}

/// Outcome of [`UtxoSpan::try_flush`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryFlush {
    Flushed,
    /// Another span holds the upgrade; release this one and retry.
    Invalidated,
}

/// Outcome of [`UtxoSpan::reattach`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reattach {
    Attached,
    /// The best block moved while detached; the span is now unusable.
    LostRace,
}

/// Counters reported by [`UtxoSet::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub written: usize,
    pub deleted: usize,
    pub evicted: usize,
}

/// Cached, durable UTXO set.
pub struct UtxoSet {
    lock: RwLock<Committed>,
    storage: Arc<dyn Storage>,
    max_entries: usize,
}

impl UtxoSet {
    /// Open over `storage`, reading the persisted best-block pointer.
    pub fn open(storage: Arc<dyn Storage>, max_entries: usize) -> StateResult<Self> {
        let best_block = match storage.get(ColumnFamily::Metadata, BEST_BLOCK_KEY)? {
            Some(bytes) => Hash256::from_slice(&bytes).ok_or_else(|| {
                StateError::Corruption(format!("best block record has {} bytes", bytes.len()))
            })?,
            None => Hash256::ZERO,
        };
        debug!(best_block = %best_block, "Opened UTXO set");
        Ok(Self {
            lock: RwLock::new(Committed {
                best_block,
                cache: Mutex::new(CoinCache::default()),
            }),
            storage,
            max_entries,
        })
    }

    /// Block whose post-state the committed set reflects.
    pub fn best_block(&self) -> Hash256 {
        self.lock.read().best_block
    }

    pub fn read_view(&self) -> UtxoReadView<'_> {
        let guard = self.lock.read();
        let base = guard.best_block;
        UtxoReadView {
            set: self,
            guard: Some(guard),
            base,
        }
    }

    pub fn span(&self) -> UtxoSpan<'_> {
        let guard = self.lock.read();
        let base = guard.best_block;
        UtxoSpan {
            set: self,
            guard: Some(guard),
            base,
            changes: HashMap::new(),
            new_best: None,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.lock.read().cache.lock().entries.len()
    }

    /// Approximate bytes held by the cache.
    pub fn memory_usage(&self) -> usize {
        self.lock.read().cache.lock().usage
    }

    pub fn dirty_len(&self) -> usize {
        self.lock
            .read()
            .cache
            .lock()
            .entries
            .values()
            .filter(|e| e.dirty)
            .count()
    }

    pub fn is_cached(&self, outpoint: &OutPoint) -> bool {
        self.lock.read().cache.lock().entries.contains_key(outpoint)
    }

    /// Drop clean entries for `outpoints`. Entries holding unpersisted
    /// changes stay.
    pub fn uncache(&self, outpoints: &[OutPoint]) -> usize {
        let guard = self.lock.read();
        let mut cache = guard.cache.lock();
        let mut removed = 0;
        for outpoint in outpoints {
            if cache.entries.get(outpoint).map_or(false, |e| !e.dirty) {
                cache.remove(outpoint);
                removed += 1;
            }
        }
        trace!(requested = outpoints.len(), removed, "Uncached coins");
        removed
    }

    /// Look up a committed coin, loading it from storage on a miss.
    ///
    /// Without `want_script` the coin may come back script-less, and a
    /// script-less load is only retained while the cache is under its
    /// entry threshold.
    fn fetch(
        &self,
        committed: &Committed,
        outpoint: &OutPoint,
        want_script: bool,
    ) -> StateResult<Option<Coin>> {
        {
            let cache = committed.cache.lock();
            if let Some(entry) = cache.entries.get(outpoint) {
                match &entry.coin {
                    None => return Ok(None),
                    Some(coin) if coin.has_script() || !want_script => {
                        return Ok(Some(coin.clone()))
                    }
                    Some(_) => {}
                }
            }
        }

        let Some(bytes) = self.storage.get(ColumnFamily::Coins, &outpoint.to_key())? else {
            return Ok(None);
        };
        let coin = if want_script {
            deserialize::<Coin>(&bytes)
        } else {
            Coin::decode_without_script(&bytes)
        }
        .map_err(|e| StateError::Corruption(format!("coin {}: {}", outpoint, e)))?;

        let mut cache = committed.cache.lock();
        let keep = coin.has_script() || cache.entries.len() < self.max_entries;
        let occupied = cache
            .entries
            .get(outpoint)
            .map_or(false, |e| e.dirty || e.coin.as_ref().map_or(true, Coin::has_script));
        if keep && !occupied {
            cache.insert(
                *outpoint,
                CacheEntry {
                    coin: Some(coin.clone()),
                    dirty: false,
                },
            );
        }
        Ok(Some(coin))
    }

    /// Persist every dirty entry and the best-block pointer, plus `extra`,
    /// as one storage batch. Afterwards clean entries are evicted if the
    /// cache is over its entry threshold.
    #[instrument(skip(self, extra), fields(extra = extra.len()))]
    pub fn flush(&self, extra: WriteBatch) -> StateResult<FlushStats> {
        let guard = self.lock.upgradable_read();
        let mut stats = FlushStats::default();
        let mut batch = WriteBatch::new();
        {
            let cache = guard.cache.lock();
            for (outpoint, entry) in cache.entries.iter().filter(|(_, e)| e.dirty) {
                match &entry.coin {
                    Some(coin) => {
                        batch.put(ColumnFamily::Coins, outpoint.to_key(), serialize(coin));
                        stats.written += 1;
                    }
                    None => {
                        batch.delete(ColumnFamily::Coins, outpoint.to_key());
                        stats.deleted += 1;
                    }
                }
            }
        }
        batch.put(
            ColumnFamily::Metadata,
            BEST_BLOCK_KEY,
            guard.best_block.as_bytes().to_vec(),
        );
        batch.merge(extra);
        self.storage.write_batch(batch)?;

        let mut cache = guard.cache.lock();
        cache.retain(|entry| entry.coin.is_some());
        for entry in cache.entries.values_mut() {
            entry.dirty = false;
        }
        if cache.entries.len() > self.max_entries {
            let before = cache.entries.len();
            cache.retain(|entry| entry.coin.as_ref().map_or(false, Coin::has_script));
            if cache.entries.len() > self.max_entries {
                cache.retain(|_| false);
            }
            stats.evicted = before - cache.entries.len();
        }
        debug!(
            written = stats.written,
            deleted = stats.deleted,
            evicted = stats.evicted,
            best_block = %guard.best_block,
            "Flushed UTXO set"
        );
        Ok(stats)
    }
}

/// Shared, read-only view of the committed set.
pub struct UtxoReadView<'a> {
    set: &'a UtxoSet,
    guard: Option<RwLockReadGuard<'a, Committed>>,
    base: Hash256,
}

impl<'a> UtxoReadView<'a> {
    fn committed(&self) -> StateResult<&Committed> {
        self.guard
            .as_deref()
            .ok_or_else(|| StateError::Inconsistent("read view used while released".into()))
    }

    /// Full coin, script included.
    pub fn get(&self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        self.set.fetch(self.committed()?, outpoint, true)
    }

    pub fn have(&self, outpoint: &OutPoint) -> StateResult<bool> {
        Ok(self.set.fetch(self.committed()?, outpoint, false)?.is_some())
    }

    pub fn best_block(&self) -> Hash256 {
        self.base
    }

    /// Give up the lock, e.g. around an expensive external call.
    pub fn release(&mut self) {
        self.guard = None;
    }

    /// Take the lock back. Fails if the set moved on while released.
    pub fn reacquire(&mut self) -> StateResult<()> {
        if self.guard.is_some() {
            return Ok(());
        }
        let guard = self.set.lock.read();
        if guard.best_block != self.base {
            return Err(StateError::BestBlockChanged {
                expected: self.base,
                actual: guard.best_block,
            });
        }
        self.guard = Some(guard);
        Ok(())
    }
}

/// Writable view. Mutations stay private until [`UtxoSpan::try_flush`].
pub struct UtxoSpan<'a> {
    set: &'a UtxoSet,
    guard: Option<RwLockReadGuard<'a, Committed>>,
    /// Committed best block observed when the lock was last taken.
    base: Hash256,
    changes: HashMap<OutPoint, Option<Coin>>,
    new_best: Option<Hash256>,
}

impl<'a> UtxoSpan<'a> {
    fn committed(&self) -> StateResult<&Committed> {
        self.guard
            .as_deref()
            .ok_or_else(|| StateError::Inconsistent("span used while detached".into()))
    }

    pub fn get(&self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        match self.changes.get(outpoint) {
            Some(change) => Ok(change.clone()),
            None => self.set.fetch(self.committed()?, outpoint, true),
        }
    }

    pub fn have(&self, outpoint: &OutPoint) -> StateResult<bool> {
        match self.changes.get(outpoint) {
            Some(change) => Ok(change.is_some()),
            None => Ok(self
                .set
                .fetch(self.committed()?, outpoint, false)?
                .is_some()),
        }
    }

    /// Spend a coin, returning it for the undo record.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        let coin = self.get(outpoint)?;
        if coin.is_some() {
            self.changes.insert(*outpoint, None);
        }
        Ok(coin)
    }

    /// Add a coin. Overwriting an unspent coin is only allowed with
    /// `possible_overwrite`.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> StateResult<()> {
        if !possible_overwrite && self.have(&outpoint)? {
            return Err(StateError::Inconsistent(format!(
                "attempt to overwrite unspent coin {}",
                outpoint
            )));
        }
        self.changes.insert(outpoint, Some(coin));
        Ok(())
    }

    pub fn best_block(&self) -> Hash256 {
        self.new_best.unwrap_or(self.base)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.new_best = Some(hash);
    }

    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    /// Publish the accumulated changes and best block atomically.
    ///
    /// Blocks until other readers release, unless another span already
    /// holds the upgrade, in which case nothing is published and
    /// [`TryFlush::Invalidated`] is returned.
    pub fn try_flush(&mut self) -> TryFlush {
        if self.guard.is_none() {
            return TryFlush::Invalidated;
        }
        let Some(upgradable) = self.set.lock.try_upgradable_read() else {
            trace!("Span flush invalidated by a concurrent upgrade");
            return TryFlush::Invalidated;
        };
        self.guard = None;
        let mut write = RwLockUpgradableReadGuard::upgrade(upgradable);

        let committed = &mut *write;
        let cache = committed.cache.get_mut();
        for (outpoint, coin) in self.changes.drain() {
            cache.insert(outpoint, CacheEntry { coin, dirty: true });
        }
        if let Some(best) = self.new_best.take() {
            committed.best_block = best;
        }
        self.base = committed.best_block;

        self.guard = Some(RwLockWriteGuard::downgrade(write));
        TryFlush::Flushed
    }

    /// Release the lock, keeping the pending changes.
    pub fn detach(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.base = guard.best_block;
        }
    }

    /// Retake the lock. Succeeds only if nobody moved the best block while
    /// the span was detached; otherwise the pending changes are discarded.
    pub fn reattach(&mut self) -> Reattach {
        if self.guard.is_some() {
            return Reattach::Attached;
        }
        let guard = self.set.lock.read();
        if guard.best_block != self.base {
            debug!(
                expected = %self.base,
                actual = %guard.best_block,
                "Span lost the race while detached"
            );
            self.changes.clear();
            self.new_best = None;
            return Reattach::LostRace;
        }
        self.guard = Some(guard);
        Reattach::Attached
    }

    /// Drop the lock and every pending change.
    pub fn force_detach(&mut self) {
        self.guard = None;
        self.changes.clear();
        self.new_best = None;
    }

    pub fn is_attached(&self) -> bool {
        self.guard.is_some()
    }
}
