//! Property-based tests using proptest.
//!
//! Random block trees and spend patterns checked against simple models:
//! a parent walk for ancestor queries, the heaviest block for selection,
//! a coin snapshot for disconnects and a closed formula for rejection
//! windows.

use crate::generators::{coinbase, mine, next_tag, regtest_params, spend, test_header};
use ferrite_consensus::{block_subsidy, Amount, Block, ChainParams, Hash256, OutPoint};
use ferrite_state::{
    set_soft_rejection, BlockDescriptor, BlockTree, ChainConfig, ChainManager, Coin,
    Collaborators, MemoryBlockFiles,
};
use ferrite_storage::MemoryStorage;
use proptest::prelude::*;
use proptest::sample::Index;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const BASE_TIME: u32 = 1_700_100_000;

// ============================================================================
// Strategies
// ============================================================================

/// Parent choices for a random tree: entry `i` picks the parent of node
/// `i + 1` among nodes `0..=i`, node 0 being genesis.
fn arb_tree_shape(max_nodes: usize) -> impl Strategy<Value = Vec<Index>> {
    prop::collection::vec(any::<Index>(), 1..max_nodes)
}

/// Tree shape together with an arrival order for its bodies.
fn arb_tree_and_order(max_nodes: usize) -> impl Strategy<Value = (Vec<Index>, Vec<usize>)> {
    arb_tree_shape(max_nodes).prop_flat_map(|shape| {
        let order: Vec<usize> = (0..shape.len()).collect();
        (Just(shape), Just(order).prop_shuffle())
    })
}

/// Per block, the unspent coins it spends (picked by index, possibly none).
fn arb_spend_plan() -> impl Strategy<Value = Vec<Vec<Index>>> {
    prop::collection::vec(prop::collection::vec(any::<Index>(), 0..3), 2..6)
}

/// Operator rejections on a line of blocks: (position, window).
fn arb_rejections(len: usize) -> impl Strategy<Value = Vec<(usize, i32)>> {
    prop::collection::vec((0..len, -1i32..8), 1..6)
}

// ============================================================================
// Helpers
// ============================================================================

fn parent_index(shape: &[Index], node: usize) -> usize {
    shape[node - 1].index(node)
}

fn in_memory(params: &ChainParams) -> ChainManager {
    ChainManager::open(
        params.clone(),
        ChainConfig::default(),
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryBlockFiles::new()),
        Collaborators::default(),
    )
    .expect("Failed to open in-memory chain")
}

/// Mine one block per shape entry. `blocks[i]` is tree node `i + 1`.
fn mine_tree(params: &ChainParams, shape: &[Index]) -> (Vec<Block>, Vec<i32>) {
    let mut hashes = vec![params.genesis_hash()];
    let mut heights = vec![0i32];
    let mut blocks = Vec::with_capacity(shape.len());
    for node in 1..=shape.len() {
        let parent = parent_index(shape, node);
        let height = heights[parent] + 1;
        let txs = vec![coinbase(height, next_tag(), block_subsidy(height, params))];
        let block = mine(params, hashes[parent], BASE_TIME + node as u32, txs);
        hashes.push(block.hash());
        heights.push(height);
        blocks.push(block);
    }
    (blocks, heights[1..].to_vec())
}

fn snapshot(manager: &ChainManager, outpoints: &[OutPoint]) -> HashMap<OutPoint, Option<Coin>> {
    let view = manager.utxo().read_view();
    outpoints
        .iter()
        .map(|op| (*op, view.get(op).expect("utxo read failed")))
        .collect()
}

// ============================================================================
// Block Tree Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Ancestor lookups agree with walking parent links one by one.
    #[test]
    fn ancestor_matches_parent_walk(shape in arb_tree_shape(160), pick in any::<Index>()) {
        let params = regtest_params();
        let tree = BlockTree::new(params.genesis_hash());
        let genesis = tree.insert(params.genesis_block().header).unwrap().into_descriptor();
        let mut nodes: Vec<Arc<BlockDescriptor>> = vec![genesis];
        for node in 1..=shape.len() {
            let parent = nodes[parent_index(&shape, node)].hash();
            let header = test_header(&params, parent, node as u32);
            nodes.push(tree.insert(header).unwrap().into_descriptor());
        }

        let desc = &nodes[pick.index(nodes.len())];
        let mut walk = Arc::clone(desc);
        for height in (0..=desc.height()).rev() {
            let found = tree.ancestor(desc, height).expect("ancestor within range");
            prop_assert_eq!(found.hash(), walk.hash());
            if let Some(parent) = tree.parent(&walk) {
                walk = parent;
            }
        }
        prop_assert!(tree.ancestor(desc, desc.height() + 1).is_none());
        prop_assert!(tree.ancestor(desc, -1).is_none());
    }

    /// Effective rejection windows only depend on the final explicit
    /// values, whatever order the operator set them in.
    #[test]
    fn rejection_windows_match_closed_form(ops in arb_rejections(16)) {
        let params = regtest_params();
        let tree = BlockTree::new(params.genesis_hash());
        let genesis = tree.insert(params.genesis_block().header).unwrap().into_descriptor();
        let mut line: Vec<Arc<BlockDescriptor>> = Vec::new();
        for nonce in 0..16u32 {
            let parent = line.last().unwrap_or(&genesis).hash();
            line.push(tree.insert(test_header(&params, parent, nonce)).unwrap().into_descriptor());
        }

        let mut explicit = vec![-1i32; line.len()];
        for (position, blocks) in &ops {
            set_soft_rejection(&tree, &line[*position], *blocks);
            explicit[*position] = *blocks;
        }

        for (i, desc) in line.iter().enumerate() {
            let expected = (0..=i)
                .map(|j| explicit[j] - (i - j) as i32)
                .max()
                .unwrap_or(-1)
                .max(-1);
            prop_assert_eq!(desc.soft_reject_effective(), expected, "position {}", i);
            prop_assert_eq!(desc.is_soft_rejected(), expected >= 0);
        }
    }
}

// ============================================================================
// Chain Manager Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// The active tip ends up on the most work, whatever order bodies arrive in.
    #[test]
    fn selection_is_independent_of_arrival_order((shape, order) in arb_tree_and_order(12)) {
        let params = regtest_params();
        let (blocks, heights) = mine_tree(&params, &shape);
        let manager = in_memory(&params);
        for block in &blocks {
            manager.accept_header(block.header.clone()).unwrap();
        }
        for &i in &order {
            manager.process_block(&blocks[i], &CancellationToken::new()).unwrap();
        }

        let best = *heights.iter().max().unwrap_or(&0);
        prop_assert_eq!(manager.height(), best);
        let tallest: Vec<Hash256> = blocks
            .iter()
            .zip(&heights)
            .filter(|(_, h)| **h == best)
            .map(|(b, _)| b.hash())
            .collect();
        let tip = manager.tip().unwrap().hash();
        prop_assert!(tallest.contains(&tip));
        prop_assert_eq!(manager.info().unlinked, 0);
        prop_assert_eq!(manager.utxo().best_block(), tip);
        for block in &blocks {
            prop_assert!(manager.get_descriptor(&block.hash()).unwrap().is_linked());
        }
    }

    /// Disconnecting blocks puts the coin set back exactly as it was.
    #[test]
    fn disconnect_restores_coins(plan in arb_spend_plan(), cut in any::<Index>()) {
        let params = regtest_params();
        let manager = in_memory(&params);
        let tag = next_tag();

        let mut unspent: Vec<(OutPoint, Amount)> = Vec::new();
        let mut created: Vec<OutPoint> = Vec::new();
        let mut blocks = Vec::with_capacity(plan.len());
        let mut prev = params.genesis_hash();
        for (i, picks) in plan.iter().enumerate() {
            let height = i as i32 + 1;
            let mut txs = vec![coinbase(height, tag, block_subsidy(height, &params))];
            for pick in picks {
                if unspent.is_empty() {
                    break;
                }
                let (op, value) = unspent.swap_remove(pick.index(unspent.len()));
                txs.push(spend(&[op], value - 1));
            }
            let block = mine(&params, prev, BASE_TIME + height as u32, txs);
            for tx in &block.transactions {
                let op = OutPoint::new(tx.txid(), 0);
                unspent.push((op, tx.outputs[0].value));
                created.push(op);
            }
            prev = block.hash();
            blocks.push(block);
        }

        let keep = 1 + cut.index(blocks.len() - 1);
        for block in &blocks[..keep] {
            manager.process_block(block, &CancellationToken::new()).unwrap();
        }
        let before = snapshot(&manager, &created);

        for block in &blocks[keep..] {
            manager.process_block(block, &CancellationToken::new()).unwrap();
        }
        prop_assert_eq!(manager.height(), blocks.len() as i32);

        manager.invalidate_block(&blocks[keep].hash()).unwrap();
        prop_assert_eq!(manager.tip().unwrap().hash(), blocks[keep - 1].hash());
        prop_assert_eq!(manager.utxo().best_block(), blocks[keep - 1].hash());
        prop_assert_eq!(snapshot(&manager, &created), before);
    }
}
