//! Dense projection of one branch of the block tree.

use crate::descriptor::BlockDescriptor;
use crate::tree::BlockTree;
use std::sync::Arc;

/// Descriptors of one branch indexed by height, genesis first.
#[derive(Debug, Default)]
pub struct Chain {
    blocks: Vec<Arc<BlockDescriptor>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<&Arc<BlockDescriptor>> {
        self.blocks.last()
    }

    pub fn genesis(&self) -> Option<&Arc<BlockDescriptor>> {
        self.blocks.first()
    }

    /// Height of the tip, -1 when empty.
    pub fn height(&self) -> i32 {
        self.blocks.len() as i32 - 1
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, height: i32) -> Option<&Arc<BlockDescriptor>> {
        if height < 0 {
            return None;
        }
        self.blocks.get(height as usize)
    }

    pub fn contains(&self, desc: &BlockDescriptor) -> bool {
        self.get(desc.height())
            .map_or(false, |d| d.handle() == desc.handle())
    }

    /// Successor of `desc` on this chain.
    pub fn next(&self, desc: &BlockDescriptor) -> Option<&Arc<BlockDescriptor>> {
        if self.contains(desc) {
            self.get(desc.height() + 1)
        } else {
            None
        }
    }

    /// Move the tip, rewriting only the part of the array that diverges.
    pub fn set_tip(&mut self, tree: &BlockTree, tip: Option<Arc<BlockDescriptor>>) {
        let Some(tip) = tip else {
            self.blocks.clear();
            return;
        };

        let tip_len = tip.height() as usize + 1;
        let mut segment = Vec::new();
        let mut walk = Some(tip);
        while let Some(desc) = walk {
            if self.contains(&desc) {
                break;
            }
            walk = tree.parent(&desc);
            segment.push(desc);
        }

        let keep = segment
            .last()
            .map_or(tip_len, |lowest| lowest.height() as usize);
        self.blocks.truncate(keep);
        self.blocks.extend(segment.into_iter().rev());
    }

    /// Last block of this chain that is also an ancestor of `desc`.
    pub fn find_fork(
        &self,
        tree: &BlockTree,
        desc: &Arc<BlockDescriptor>,
    ) -> Option<Arc<BlockDescriptor>> {
        let mut walk = if desc.height() > self.height() {
            tree.ancestor(desc, self.height())?
        } else {
            Arc::clone(desc)
        };
        while !self.contains(&walk) {
            walk = tree.parent(&walk)?;
        }
        Some(walk)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<BlockDescriptor>> {
        self.blocks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_consensus::{BlockHeader, ChainParams, Hash256};

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
    fn test_set_tip_and_switch_branch() {
        let params = ChainParams::regtest();
        let tree = BlockTree::new(params.genesis_hash());
        let genesis = tree
            .insert(params.genesis_block().header)
            .unwrap()
            .into_descriptor();
        let a1 = child(&tree, &genesis, 1);
        let a2 = child(&tree, &a1, 1);
        let b1 = child(&tree, &genesis, 2);
        let b2 = child(&tree, &b1, 2);
        let b3 = child(&tree, &b2, 2);

        let mut chain = Chain::new();
        assert_eq!(chain.height(), -1);
        chain.set_tip(&tree, Some(Arc::clone(&a2)));
        assert_eq!(chain.height(), 2);
        assert!(chain.contains(&a1));
        assert_eq!(chain.next(&genesis).unwrap().hash(), a1.hash());

        chain.set_tip(&tree, Some(Arc::clone(&b3)));
        assert_eq!(chain.height(), 3);
        assert!(!chain.contains(&a1));
        assert!(chain.contains(&b2));
        assert_eq!(chain.find_fork(&tree, &a2).unwrap().hash(), genesis.hash());

        // Moving back onto the existing chain only truncates.
        chain.set_tip(&tree, Some(Arc::clone(&b1)));
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip().unwrap().hash(), b1.hash());

        chain.set_tip(&tree, None);
        assert!(chain.is_empty());
    }
}
