//! Mempool reconciliation against the real pool.

use crate::generators::{coinbase_outpoint, spend, BlockGen};
use crate::harness::TestChain;
use ferrite_consensus::{OutPoint, Transaction};
use ferrite_mempool::MempoolError;

fn accept(chain: &TestChain, tx: &Transaction) {
    chain
        .mempool
        .accept_to_pool(tx.clone(), chain.manager.utxo())
        .unwrap();
}

fn output(tx: &Transaction) -> OutPoint {
    OutPoint::new(tx.txid(), 0)
}

#[test]
fn test_connected_block_confirms_pool_transactions() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.next(&[]);
    chain.process(&a);

    let value = chain.coin(&coinbase_outpoint(&a)).unwrap().value;
    let parent = spend(&[coinbase_outpoint(&a)], value - 2_000);
    let child = spend(&[output(&parent)], value - 3_000);
    accept(&chain, &parent);
    accept(&chain, &child);
    assert_eq!(chain.mempool.len(), 2);
    assert_eq!(chain.mempool.get(&child.txid()).unwrap().fee, Some(1_000));

    chain.process(&main.next(&[parent.clone()]));
    assert!(!chain.mempool.contains(&parent.txid()));
    assert!(chain.mempool.contains(&child.txid()));

    chain.process(&main.next(&[child.clone()]));
    assert!(chain.mempool.is_empty());
}

#[test]
fn test_conflicting_block_evicts_spender_and_descendants() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.next(&[]);
    chain.process(&a);
    let o = coinbase_outpoint(&a);
    let value = chain.coin(&o).unwrap().value;

    let pooled = spend(&[o], value - 1_000);
    let pooled_child = spend(&[output(&pooled)], value - 2_000);
    accept(&chain, &pooled);
    accept(&chain, &pooled_child);

    let rival = spend(&[o], value - 5_000);
    chain.process(&main.next(&[rival]));
    assert!(chain.mempool.is_empty());
    assert_eq!(chain.mempool.spender_of(&o), None);
}

#[test]
fn test_reorg_returns_transactions_without_fee() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.next(&[]);
    chain.process(&a);
    let o = coinbase_outpoint(&a);
    let confirmed = spend(&[o], 7_000);
    chain.process(&main.next(&[confirmed.clone()]));
    assert!(chain.mempool.is_empty());

    let mut side = BlockGen::fork(&params, a.hash(), 1);
    chain.process_all(&side.extend(2));

    let returned = chain.mempool.get(&confirmed.txid()).unwrap();
    assert_eq!(returned.fee, None);
    assert_eq!(chain.mempool.spender_of(&o), Some(confirmed.txid()));

    // The coin is unspent again, so a rival spend is a pool double spend.
    let rival = spend(&[o], 6_000);
    match chain.mempool.accept_to_pool(rival, chain.manager.utxo()) {
        Err(MempoolError::DoubleSpend { spender, .. }) => assert_eq!(spender, confirmed.txid()),
        other => panic!("expected DoubleSpend, got {:?}", other),
    }
}

#[test]
fn test_returned_transaction_loses_to_new_branch_conflict() {
    let chain = TestChain::new();
    let params = chain.params().clone();
    let mut main = BlockGen::new(&params);
    let a = main.next(&[]);
    chain.process(&a);
    let o = coinbase_outpoint(&a);

    let ours = spend(&[o], 7_000);
    chain.process(&main.next(&[ours.clone()]));

    let theirs = spend(&[o], 8_000);
    let mut side = BlockGen::fork(&params, a.hash(), 1);
    let b2 = side.next(&[theirs.clone()]);
    let b3 = side.next(&[]);
    chain.process(&b2);
    chain.process(&b3);

    assert_eq!(chain.tip_hash(), b3.hash());
    assert!(!chain.mempool.contains(&ours.txid()));
    assert!(!chain.mempool.contains(&theirs.txid()));
    assert!(chain.mempool.is_empty());
}

#[test]
fn test_refused_spend_of_missing_coin() {
    let chain = TestChain::new();
    let blocks = BlockGen::new(chain.params()).extend(1);
    chain.process_all(&blocks);
    let missing = OutPoint::new(blocks[0].transactions[0].txid(), 5);

    let err = chain
        .mempool
        .accept_to_pool(spend(&[missing], 1), chain.manager.utxo())
        .unwrap_err();
    assert!(matches!(err, MempoolError::MissingInput(op) if op == missing));
    assert!(chain.mempool.is_empty());
}
