//! Concurrent block processing and validation races.

use crate::generators::{coinbase_outpoint, spend, BlockGen, SlowScripts};
use crate::harness::{test_config, TestChain};
use ferrite_consensus::{Block, NoFrozenOutputs};
use ferrite_state::ActivateOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn assert_consistent(chain: &TestChain) {
    assert!(!chain.manager.is_aborted());
    assert_eq!(chain.manager.utxo().best_block(), chain.tip_hash());
}

#[test]
fn test_bodies_from_many_threads() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let trunk = main.extend(12);
    let mut side = BlockGen::fork(&params, trunk[5].hash(), 6);
    let branch = side.extend(9);

    for block in trunk.iter().chain(branch.iter()) {
        chain.manager.accept_header(block.header.clone()).unwrap();
    }

    let all: Vec<Block> = trunk.iter().chain(branch.iter()).cloned().collect();
    std::thread::scope(|s| {
        for lane in 0..4usize {
            let chain = &chain;
            let all = &all;
            s.spawn(move || {
                let mine: Vec<&Block> = all.iter().skip(lane).step_by(4).collect();
                let ordered: Vec<&Block> = if lane % 2 == 0 {
                    mine.into_iter().rev().collect()
                } else {
                    mine
                };
                for block in ordered {
                    chain
                        .manager
                        .process_block(block, &CancellationToken::new())
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(chain.tip_hash(), branch[8].hash());
    assert_eq!(chain.height(), 15);
    assert_eq!(chain.manager.info().unlinked, 0);
    assert_consistent(&chain);
}

#[test]
fn test_competing_blocks_validated_in_parallel() {
    let scripts = Arc::new(SlowScripts::new(Duration::from_millis(30)));
    let chain = TestChain::with_collaborators(test_config(), scripts.clone(), Arc::new(NoFrozenOutputs));
    let params = chain.params().clone();
    let mut base = BlockGen::new(&params);
    let funding = base.extend(2);
    chain.process_all(&funding);

    let mut left = base.branch();
    let mut right = base.branch();
    let l = left.next(&[spend(&[coinbase_outpoint(&funding[0])], 1_000)]);
    let r = right.next(&[spend(&[coinbase_outpoint(&funding[1])], 1_000)]);

    std::thread::scope(|s| {
        let chain = &chain;
        let left_block = &l;
        let right_block = &r;
        s.spawn(move || chain.process(left_block));
        s.spawn(move || chain.process(right_block));
    });

    let tip = chain.tip_hash();
    assert!(tip == l.hash() || tip == r.hash());
    assert!(scripts.checked() >= 1);
    assert!(!chain.manager.get_descriptor(&l.hash()).unwrap().is_invalid());
    assert!(!chain.manager.get_descriptor(&r.hash()).unwrap().is_invalid());
    assert_consistent(&chain);

    // The losing branch takes over once it grows.
    let (loser, mut grower) = if tip == l.hash() { (r, right) } else { (l, left) };
    let next = grower.next(&[]);
    chain.process(&next);
    assert_eq!(chain.tip_hash(), next.hash());
    assert!(chain.manager.is_on_active_chain(&loser.hash()));
    assert_consistent(&chain);
}

#[test]
fn test_better_chain_overtakes_slow_validation() {
    let scripts = Arc::new(SlowScripts::new(Duration::from_millis(400)));
    let chain = TestChain::with_collaborators(test_config(), scripts.clone(), Arc::new(NoFrozenOutputs));
    let params = chain.params().clone();
    let mut base = BlockGen::new(&params);
    let a = base.next(&[]);
    chain.process(&a);

    let mut slow_branch = base.branch();
    let slow = slow_branch.next(&[spend(&[coinbase_outpoint(&a)], 500)]);
    let mut fast_branch = base.branch();
    let fast = fast_branch.extend(2);

    std::thread::scope(|s| {
        let chain = &chain;
        let slow = &slow;
        let fast = &fast;
        s.spawn(move || chain.process(slow));
        s.spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            chain.process_all(fast);
        });
    });

    assert_eq!(chain.tip_hash(), fast[1].hash());
    let slow_desc = chain.manager.get_descriptor(&slow.hash()).unwrap();
    assert!(!slow_desc.is_invalid());
    assert!(!chain.manager.is_on_active_chain(&slow.hash()));
    assert!(chain.coin(&coinbase_outpoint(&a)).is_some());
    assert_consistent(&chain);
}

#[test]
fn test_caller_cancellation_leaves_valid_state() {
    let scripts = Arc::new(SlowScripts::new(Duration::from_millis(200)));
    let chain = TestChain::with_collaborators(test_config(), scripts.clone(), Arc::new(NoFrozenOutputs));
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.next(&[]);
    chain.process(&a);
    let b = main.next(&[spend(&[coinbase_outpoint(&a)], 500)]);

    let cancel = CancellationToken::new();
    let outcome = std::thread::scope(|s| {
        let worker = s.spawn(|| chain.manager.process_block(&b, &cancel));
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        worker.join().unwrap()
    });

    // Depending on timing the check may have finished first.
    match outcome.unwrap() {
        ActivateOutcome::Cancelled => assert_eq!(chain.tip_hash(), a.hash()),
        ActivateOutcome::Completed => assert_eq!(chain.tip_hash(), b.hash()),
    }
    assert!(!chain.manager.get_descriptor(&b.hash()).unwrap().is_invalid());
    assert_consistent(&chain);

    chain
        .manager
        .activate_best_chain(&CancellationToken::new())
        .unwrap();
    assert_eq!(chain.tip_hash(), b.hash());
}

#[test]
fn test_mempool_admission_alongside_block_processing() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let funding = main.extend(6);
    chain.process_all(&funding);
    let later = main.extend(6);

    std::thread::scope(|s| {
        let chain = &chain;
        let funding = &funding;
        let later = &later;
        s.spawn(move || chain.process_all(later));
        s.spawn(move || {
            for block in funding {
                let tx = spend(&[coinbase_outpoint(block)], 1_000);
                chain
                    .mempool
                    .accept_to_pool(tx, chain.manager.utxo())
                    .unwrap();
            }
        });
    });

    assert_eq!(chain.height(), 12);
    assert_eq!(chain.mempool.len(), 6);
    assert_consistent(&chain);
}
