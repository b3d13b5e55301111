//! In-memory storage with the same contract as [`Database`](crate::Database).

use crate::batch::BatchOp;
use crate::{ColumnFamily, Storage, StorageResult, WriteBatch};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type Family = BTreeMap<Vec<u8>, Vec<u8>>;

/// Storage backed by ordered in-memory maps.
///
/// Batches are applied under a single write lock, so readers never see a
/// partially applied batch.
#[derive(Default)]
pub struct MemoryStorage {
    families: RwLock<HashMap<ColumnFamily, Family>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a column family.
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.families.read().get(&cf).map_or(0, BTreeMap::len)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .families
            .read()
            .get(&cf)
            .and_then(|family| family.get(key).cloned()))
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.families
            .write()
            .entry(cf)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()> {
        if let Some(family) = self.families.write().get_mut(&cf) {
            family.remove(key);
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut families = self.families.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { cf, key, value } => {
                    families.entry(cf).or_default().insert(key, value);
                }
                BatchOp::Delete { cf, key } => {
                    if let Some(family) = families.get_mut(&cf) {
                        family.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let snapshot: Vec<_> = self
            .families
            .read()
            .get(&cf)
            .map(|family| family.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Box::new(snapshot.into_iter()))
    }
}
