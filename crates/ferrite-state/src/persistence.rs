//! Block index persistence.
//!
//! Only a descriptor's persisted fields are written. Everything derived
//! (links, chain work, chain-tx, effective soft rejection, freezes,
//! candidate and unlinked membership) is recomputed after loading.

use crate::descriptor::{BlockDescriptor, BlockStatus, BlockValidity, DescriptorState};
use crate::policy::recompute_soft_rejection;
use crate::tree::BlockTree;
use crate::{StateError, StateResult};
use ferrite_consensus::encoding::{deserialize, serialize, Decodable, Decoder, Encodable, Encoder};
use ferrite_consensus::{BlockHeader, ConsensusError, ConsensusResult, Hash256};
use ferrite_storage::{ColumnFamily, FilePos, Storage, WriteBatch};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// On-disk form of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DescriptorRecord {
    pub(crate) header: BlockHeader,
    pub(crate) height: i32,
    pub(crate) validity: BlockValidity,
    pub(crate) status: u8,
    pub(crate) data_pos: Option<FilePos>,
    pub(crate) disk_size: u32,
    pub(crate) tx_count: u32,
    pub(crate) undo_pos: Option<FilePos>,
    pub(crate) soft_reject_explicit: i32,
}

fn put_pos(encoder: &mut Encoder, pos: Option<FilePos>) {
    match pos {
        Some(pos) => {
            encoder.put_u8(1);
            encoder.put_bytes(&pos.to_bytes());
        }
        None => encoder.put_u8(0),
    }
}

fn get_pos(decoder: &mut Decoder<'_>) -> ConsensusResult<Option<FilePos>> {
    match decoder.get_u8()? {
        0 => Ok(None),
        1 => {
            let bytes = decoder.take(FilePos::ENCODED_LEN)?;
            Ok(FilePos::from_bytes(bytes))
        }
        tag => Err(ConsensusError::Decode(format!("bad position tag {}", tag))),
    }
}

impl DescriptorRecord {
    pub(crate) fn of(desc: &BlockDescriptor) -> Self {
        let state = desc.state_snapshot();
        Self {
            header: desc.header().clone(),
            height: desc.height(),
            validity: state.validity,
            status: state.status.bits(),
            data_pos: state.data_pos,
            disk_size: state.disk_size,
            tx_count: state.tx_count,
            undo_pos: state.undo_pos,
            soft_reject_explicit: state.soft_reject_explicit,
        }
    }

    fn into_state(self) -> DescriptorState {
        DescriptorState {
            validity: self.validity,
            status: BlockStatus::from_bits_truncate(self.status),
            data_pos: self.data_pos,
            undo_pos: self.undo_pos,
            disk_size: self.disk_size,
            tx_count: self.tx_count,
            soft_reject_explicit: self.soft_reject_explicit,
            ..DescriptorState::default()
        }
    }
}

impl Encodable for DescriptorRecord {
    fn encode(&self, encoder: &mut Encoder) {
        self.header.encode(encoder);
        encoder.put_i32(self.height);
        encoder.put_u8(self.validity as u8);
        encoder.put_u8(self.status);
        put_pos(encoder, self.data_pos);
        encoder.put_u32(self.disk_size);
        encoder.put_u32(self.tx_count);
        put_pos(encoder, self.undo_pos);
        encoder.put_i32(self.soft_reject_explicit);
    }
}

impl Decodable for DescriptorRecord {
    fn decode(decoder: &mut Decoder<'_>) -> ConsensusResult<Self> {
        let header = BlockHeader::decode(decoder)?;
        let height = decoder.get_i32()?;
        let raw_validity = decoder.get_u8()?;
        let validity = BlockValidity::from_u8(raw_validity).ok_or_else(|| {
            ConsensusError::Decode(format!("bad validity level {}", raw_validity))
        })?;
        Ok(Self {
            header,
            height,
            validity,
            status: decoder.get_u8()?,
            data_pos: get_pos(decoder)?,
            disk_size: decoder.get_u32()?,
            tx_count: decoder.get_u32()?,
            undo_pos: get_pos(decoder)?,
            soft_reject_explicit: decoder.get_i32()?,
        })
    }
}

/// Batch writing the records of `descriptors`.
pub(crate) fn index_batch(descriptors: &[Arc<BlockDescriptor>]) -> WriteBatch {
    let mut batch = WriteBatch::with_capacity(descriptors.len());
    for desc in descriptors {
        batch.put(
            ColumnFamily::BlockIndex,
            desc.hash().as_bytes().to_vec(),
            serialize(&DescriptorRecord::of(desc)),
        );
    }
    batch
}

/// Load every stored descriptor into `tree`, parents first.
#[instrument(skip(storage, tree))]
pub(crate) fn load_block_index(storage: &dyn Storage, tree: &BlockTree) -> StateResult<usize> {
    let mut records = Vec::new();
    for (key, value) in storage.iter(ColumnFamily::BlockIndex)? {
        let record: DescriptorRecord = deserialize(&value)
            .map_err(|e| StateError::Corruption(format!("block index record: {}", e)))?;
        let hash = record.header.hash();
        if Hash256::from_slice(&key) != Some(hash) {
            return Err(StateError::Corruption(format!(
                "block index key {} does not match header {}",
                hex_key(&key),
                hash
            )));
        }
        records.push(record);
    }
    records.sort_by_key(|r| r.height);

    let count = records.len();
    for record in records {
        let header = record.header.clone();
        let height = record.height;
        tree.insert_loaded(header, height, record.into_state())?;
    }
    info!(descriptors = count, "Loaded block index");
    Ok(count)
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Recompute chain-tx, failed-by-parent and effective soft rejection for
/// every descriptor.
pub(crate) fn recompute_derived(tree: &BlockTree) {
    let mut all = tree.snapshot();
    all.sort_by_key(|d| d.height());
    let mut newly_failed = 0usize;
    for desc in &all {
        let parent = tree.parent(desc);
        let chain_tx = match (&parent, desc.has_data()) {
            (_, false) => 0,
            (None, true) => desc.tx_count() as u64,
            (Some(parent), true) if parent.is_linked() => parent.chain_tx() + desc.tx_count() as u64,
            (Some(_), true) => 0,
        };
        desc.set_chain_tx(chain_tx);

        if parent.as_ref().map_or(false, |p| p.is_invalid()) && desc.mark_failed_parent() {
            newly_failed += 1;
        }
    }
    if newly_failed > 0 {
        warn!(newly_failed, "Descendants of failed blocks were not marked on disk");
    }
    recompute_soft_rejection(tree);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_consensus::ChainParams;
    use ferrite_storage::MemoryStorage;

    fn child(tree: &BlockTree, parent: &BlockDescriptor, tag: u32) -> Arc<BlockDescriptor> {
        let header = BlockHeader {
            version: 1,
            prev_hash: parent.hash(),
            merkle_root: Hash256::ZERO,
            time: parent.header().time + 1,
            bits: parent.header().bits,
            nonce: tag,
        };
        tree.insert(header).unwrap().into_descriptor()
    }

    #[test]
    fn test_record_encoding() {
        let params = ChainParams::regtest();
        let tree = BlockTree::new(params.genesis_hash());
        let genesis = tree
            .insert(params.genesis_block().header)
            .unwrap()
            .into_descriptor();
        genesis.set_block_data(FilePos { file: 2, offset: 40 }, 285, 1);
        genesis.set_soft_reject_explicit(4);
        let record = DescriptorRecord::of(&genesis);
        let decoded: DescriptorRecord = deserialize(&serialize(&record)).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.undo_pos, None);
    }

    #[test]
    fn test_reload_recomputes_derived_fields() {
        let params = ChainParams::regtest();
        let storage = MemoryStorage::new();

        let tree = BlockTree::new(params.genesis_hash());
        let genesis = tree
            .insert(params.genesis_block().header)
            .unwrap()
            .into_descriptor();
        genesis.set_block_data(FilePos { file: 0, offset: 0 }, 100, 1);
        let a = child(&tree, &genesis, 1);
        a.set_block_data(FilePos { file: 0, offset: 1 }, 100, 3);
        let b = child(&tree, &a, 1);
        let c = child(&tree, &b, 1);
        c.set_block_data(FilePos { file: 0, offset: 2 }, 100, 2);
        a.set_soft_reject_explicit(1);
        a.mark_failed();
        a.set_freeze_explicit(5);

        storage.write_batch(index_batch(&tree.extract_dirty())).unwrap();

        let reloaded = BlockTree::new(params.genesis_hash());
        assert_eq!(load_block_index(&storage, &reloaded).unwrap(), 4);
        recompute_derived(&reloaded);

        let a2 = reloaded.get(&a.hash()).unwrap();
        let b2 = reloaded.get(&b.hash()).unwrap();
        let c2 = reloaded.get(&c.hash()).unwrap();
        assert_eq!(a2.chain_tx(), 4);
        assert_eq!(c2.chain_tx(), 0);
        assert!(a2.is_failed());
        assert!(b2.is_failed_parent());
        assert!(c2.is_failed_parent());
        assert_eq!(b2.soft_reject_effective(), 0);
        assert_eq!(c2.soft_reject_effective(), -1);
        assert_eq!(a2.freeze_explicit(), -1);
        assert_eq!(a2.chain_work(), a.chain_work());
    }

    #[test]
    fn test_mismatched_key_is_corruption() {
        let params = ChainParams::regtest();
        let storage = MemoryStorage::new();
        let tree = BlockTree::new(params.genesis_hash());
        let genesis = tree
            .insert(params.genesis_block().header)
            .unwrap()
            .into_descriptor();
        storage
            .put(
                ColumnFamily::BlockIndex,
                &[0u8; 32],
                &serialize(&DescriptorRecord::of(&genesis)),
            )
            .unwrap();
        let reloaded = BlockTree::new(params.genesis_hash());
        assert!(matches!(
            load_block_index(&storage, &reloaded),
            Err(StateError::Corruption(_))
        ));
    }
}
