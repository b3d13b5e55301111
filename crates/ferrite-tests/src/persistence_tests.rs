//! Recovery tests: reopening the on-disk chain state.

use crate::generators::{coinbase_outpoint, spend, BlockGen, RejectScript};
use crate::harness::{test_config, TestChain};
use ferrite_consensus::{NoFrozenOutputs, OutPoint};
use ferrite_state::{FlushMode, ValidationTime};
use std::sync::Arc;

#[test]
fn test_reopen_restores_tip_coins_and_blocks() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.next(&[]);
    let tx = spend(&[coinbase_outpoint(&a)], 1_000);
    let b = main.next(&[tx.clone()]);
    chain.process(&a);
    chain.process(&b);

    let chain = chain.reopen();
    assert_eq!(chain.tip_hash(), b.hash());
    assert_eq!(chain.manager.utxo().best_block(), b.hash());
    assert!(chain.coin(&coinbase_outpoint(&a)).is_none());
    assert_eq!(chain.coin(&OutPoint::new(tx.txid(), 0)).unwrap().value, 1_000);
    assert_eq!(chain.manager.read_block(&b.hash()).unwrap(), b);

    let tip = chain.manager.tip().unwrap();
    assert_eq!(tip.validation_time(), ValidationTime::Earliest);
    assert!(tip.is_linked());
}

#[test]
fn test_side_branch_can_win_after_restart() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.extend(2);
    let mut side = BlockGen::fork(&params, a[0].hash(), 1);
    let b = side.next(&[]);
    chain.process_all(&a);
    chain.process(&b);

    let chain = chain.reopen();
    assert_eq!(chain.tip_hash(), a[1].hash());
    let b_desc = chain.manager.get_descriptor(&b.hash()).unwrap();
    assert!(b_desc.is_linked());
    // Never connected, so never validated.
    assert_eq!(b_desc.validation_time(), ValidationTime::Never);

    // One more block on the side branch wins after the restart.
    chain.process(&side.next(&[]));
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.tip_hash(), side.tip());
}

#[test]
fn test_soft_rejection_survives_restart() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let blocks = BlockGen::new(&params).extend(3);
    chain.process_all(&blocks);
    chain.manager.set_soft_rejected_for(&blocks[2].hash(), 1).unwrap();
    assert_eq!(chain.tip_hash(), blocks[1].hash());

    let chain = chain.reopen();
    assert_eq!(chain.tip_hash(), blocks[1].hash());
    let desc = chain.manager.get_descriptor(&blocks[2].hash()).unwrap();
    assert_eq!(desc.soft_reject_explicit(), 1);
    assert_eq!(desc.soft_reject_effective(), 1);
}

#[test]
fn test_freeze_is_forgotten_on_restart() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let blocks = BlockGen::new(&params).extend(2);
    chain.process_all(&blocks);
    chain.manager.soft_consensus_freeze(&blocks[1].hash(), 5).unwrap();
    assert_eq!(chain.tip_hash(), blocks[0].hash());
    chain.manager.flush(FlushMode::Always).unwrap();

    let chain = chain.reopen();
    let desc = chain.manager.get_descriptor(&blocks[1].hash()).unwrap();
    assert!(!desc.is_in_soft_consensus_freeze());
    assert_eq!(chain.tip_hash(), blocks[1].hash());
}

#[test]
fn test_failed_blocks_stay_failed_after_crash() {
    let chain = TestChain::with_collaborators(
        test_config(),
        Arc::new(RejectScript(vec![0x66])),
        Arc::new(NoFrozenOutputs),
    );
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.next(&[]);
    chain.process(&a);
    let mut tx = spend(&[coinbase_outpoint(&a)], 10);
    tx.inputs[0].script_sig = vec![0x66];
    let bad = main.next(&[tx]);
    assert!(chain.try_process(&bad).is_err());
    chain.manager.flush(FlushMode::Always).unwrap();

    let chain = chain.reopen_after_crash();
    assert_eq!(chain.tip_hash(), a.hash());
    assert!(chain.manager.get_descriptor(&bad.hash()).unwrap().is_failed());
    let err = chain.try_process(&bad).unwrap_err();
    assert_eq!(err.rejection().unwrap().reason(), "duplicate-invalid");
}

#[test]
fn test_crash_leaves_consistent_state() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    chain.process_all(&main.extend(4));
    let tip = chain.tip_hash();

    let chain = chain.reopen_after_crash();
    assert_eq!(chain.manager.utxo().best_block(), chain.tip_hash());
    assert_eq!(chain.tip_hash(), tip);

    chain.process(&main.next(&[]));
    assert_eq!(chain.height(), 5);
}
