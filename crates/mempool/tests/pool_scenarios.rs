//! End-to-end acceptance scenarios against a seeded UTXO cache.

use std::sync::Arc;

use cashd_chainstate::{
    CacheConfig, SequenceLock, UtxoCache, UtxoView, ValidationError,
};
use cashd_consensus::{chain_params, Network};
use cashd_mempool::{
    ChainAdapter, MempoolError, Policy, PoolConfig, RejectCode, ScriptValidator, TxPool,
};
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::{Transaction, TxIn, TxOut};
use cashd_script::{HashCache, ScriptFlags, SigCache};
use cashd_storage::memory::MemoryStore;

fn p2pkh(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// A push-only signature script large enough to keep transactions above
/// the consensus minimum size.
fn fake_sig_script() -> Vec<u8> {
    let mut script = vec![0x4b];
    script.extend_from_slice(&[0u8; 75]);
    script
}

fn spend(inputs: &[OutPoint], outputs: &[(i64, u8)]) -> Arc<Transaction> {
    Arc::new(Transaction {
        version: 2,
        vin: inputs
            .iter()
            .map(|outpoint| TxIn {
                prevout: *outpoint,
                script_sig: fake_sig_script(),
                sequence: u32::MAX,
            })
            .collect(),
        vout: outputs
            .iter()
            .map(|(value, tag)| TxOut::new(*value, p2pkh(*tag)))
            .collect(),
        lock_time: 0,
    })
}

struct TestChainView {
    best_height: i32,
    median_time_past: i64,
}

impl ChainAdapter for TestChainView {
    fn best_height(&self) -> i32 {
        self.best_height
    }

    fn median_time_past(&self) -> i64 {
        self.median_time_past
    }

    fn calc_sequence_lock(
        &self,
        _tx: &Transaction,
        _view: &UtxoView,
    ) -> Result<SequenceLock, ValidationError> {
        Ok(SequenceLock::unrestricted())
    }

    fn is_deployment_active(&self, _deployment_id: u32) -> Result<bool, ValidationError> {
        Ok(true)
    }
}

struct AcceptAllScripts;

impl ScriptValidator for AcceptAllScripts {
    fn validate_transaction_scripts(
        &self,
        tx: &Transaction,
        _view: &UtxoView,
        _flags: ScriptFlags,
        _sig_cache: &SigCache,
        _hash_cache: &HashCache,
        _upgrade9_height: i32,
    ) -> Result<u32, ValidationError> {
        Ok(tx.vin.len() as u32)
    }
}

struct Harness {
    pool: TxPool<MemoryStore>,
    cache: Arc<UtxoCache<MemoryStore>>,
}

fn harness_with_policy(policy: Policy) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(UtxoCache::new(store, CacheConfig::default()));
    let pool = TxPool::new(PoolConfig {
        policy,
        chain_params: chain_params(Network::Regtest),
        utxo_cache: Arc::clone(&cache),
        chain: Arc::new(TestChainView {
            best_height: 200,
            median_time_past: 1_700_000_000,
        }),
        script_validator: Arc::new(AcceptAllScripts),
        sig_cache: Arc::new(SigCache::new(1_000)),
        hash_cache: Arc::new(HashCache::new(100)),
        addr_index: None,
        fee_estimator: None,
    });
    Harness { pool, cache }
}

fn harness() -> Harness {
    harness_with_policy(Policy::default())
}

impl Harness {
    /// Puts an unspent output into the UTXO cache as if a block had
    /// created it.
    fn seed_utxo(&self, outpoint: OutPoint, value: i64, height: i32) {
        let mut view = UtxoView::new();
        view.add_output(outpoint, &TxOut::new(value, p2pkh(0x77)), false, height);
        self.cache.commit(&mut view).expect("seed utxo");
    }
}

fn rule_code(err: &MempoolError) -> RejectCode {
    match err {
        MempoolError::Rule(rule) => rule.code,
        other => panic!("expected rule error, got {other:?}"),
    }
}

#[test]
fn admission() {
    let harness = harness();
    let funding = OutPoint::new([0xaa; 32], 0);
    harness.seed_utxo(funding, 10_000, 100);

    let tx1 = spend(&[funding], &[(9_000, 1)]);
    let accepted = harness
        .pool
        .process_transaction(Arc::clone(&tx1), false, false, 0)
        .expect("accept");

    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].fee, 1_000);
    assert_eq!(accepted[0].height, 200);
    assert_eq!(harness.pool.count(), 1);
    assert!(harness.pool.contains(&tx1.txid()));
    assert_eq!(harness.pool.check_spend(&funding), Some(tx1.txid()));
    assert!(harness.pool.last_updated() > 0);
}

#[test]
fn in_pool_double_spend_rejected() {
    let harness = harness();
    let funding = OutPoint::new([0xaa; 32], 0);
    harness.seed_utxo(funding, 10_000, 100);

    let tx1 = spend(&[funding], &[(9_000, 1)]);
    harness
        .pool
        .process_transaction(Arc::clone(&tx1), false, false, 0)
        .expect("accept");

    let tx2 = spend(&[funding], &[(8_500, 2)]);
    let err = harness
        .pool
        .process_transaction(tx2, false, false, 0)
        .unwrap_err();
    assert_eq!(rule_code(&err), RejectCode::Duplicate);

    assert_eq!(harness.pool.count(), 1);
    assert_eq!(harness.pool.check_spend(&funding), Some(tx1.txid()));
}

#[test]
fn duplicate_submission_rejected() {
    let harness = harness();
    let funding = OutPoint::new([0xaa; 32], 0);
    harness.seed_utxo(funding, 10_000, 100);

    let tx1 = spend(&[funding], &[(9_000, 1)]);
    harness
        .pool
        .process_transaction(Arc::clone(&tx1), false, false, 0)
        .expect("accept");
    let err = harness
        .pool
        .process_transaction(tx1, false, false, 0)
        .unwrap_err();
    assert_eq!(rule_code(&err), RejectCode::Duplicate);
}

#[test]
fn coinbase_rejected() {
    let harness = harness();
    let coinbase = Arc::new(Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: fake_sig_script(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(5_000_000_000, p2pkh(1))],
        lock_time: 0,
    });
    let err = harness
        .pool
        .process_transaction(coinbase, false, false, 0)
        .unwrap_err();
    assert_eq!(rule_code(&err), RejectCode::Invalid);
}

#[test]
fn mined_duplicate_rejected() {
    let harness = harness();
    let funding = OutPoint::new([0xaa; 32], 0);
    let tx1 = spend(&[funding], &[(9_000, 1)]);

    // The chain already knows this transaction: one of its outputs is
    // unspent in the UTXO set.
    harness.seed_utxo(OutPoint::new(tx1.txid(), 0), 9_000, 150);

    let err = harness
        .pool
        .process_transaction(tx1, false, false, 0)
        .unwrap_err();
    assert_eq!(rule_code(&err), RejectCode::Duplicate);
}

#[test]
fn orphan_stash_and_promotion() {
    let harness = harness();
    let funding = OutPoint::new([0xbb; 32], 0);
    harness.seed_utxo(funding, 50_000, 100);

    let tx_parent = spend(&[funding], &[(40_000, 1)]);
    let tx_child = spend(&[OutPoint::new(tx_parent.txid(), 0)], &[(30_000, 2)]);

    // The child arrives first; its parent is unknown.
    let accepted = harness
        .pool
        .process_transaction(Arc::clone(&tx_child), true, false, 5)
        .expect("stash orphan");
    assert!(accepted.is_empty());
    assert_eq!(harness.pool.orphan_count(), 1);
    assert!(harness.pool.is_orphan_in_pool(&tx_child.txid()));
    assert!(!harness.pool.contains(&tx_child.txid()));

    // The parent arrives and drags the child in behind it.
    let accepted = harness
        .pool
        .process_transaction(Arc::clone(&tx_parent), true, false, 5)
        .expect("accept parent");
    assert_eq!(accepted.len(), 2);
    assert_eq!(accepted[0].tx.txid(), tx_parent.txid());
    assert_eq!(accepted[1].tx.txid(), tx_child.txid());

    assert_eq!(harness.pool.count(), 2);
    assert_eq!(harness.pool.orphan_count(), 0);
    assert!(harness.pool.have_transaction(&tx_child.txid()));
}

#[test]
fn orphan_rejected_when_not_allowed() {
    let harness = harness();
    let tx_child = spend(&[OutPoint::new([0x11; 32], 0)], &[(30_000, 2)]);

    let err = harness
        .pool
        .process_transaction(tx_child, false, false, 0)
        .unwrap_err();
    assert_eq!(rule_code(&err), RejectCode::Duplicate);
    assert_eq!(harness.pool.orphan_count(), 0);
}

#[test]
fn promotion_chain_runs_to_depth() {
    let harness = harness();
    let funding = OutPoint::new([0xcc; 32], 0);
    harness.seed_utxo(funding, 100_000, 100);

    let tx_a = spend(&[funding], &[(90_000, 1)]);
    let tx_b = spend(&[OutPoint::new(tx_a.txid(), 0)], &[(80_000, 2)]);
    let tx_c = spend(&[OutPoint::new(tx_b.txid(), 0)], &[(70_000, 3)]);

    // Grandchild then child arrive before the parent.
    harness
        .pool
        .process_transaction(Arc::clone(&tx_c), true, false, 1)
        .expect("stash");
    harness
        .pool
        .process_transaction(Arc::clone(&tx_b), true, false, 1)
        .expect("stash");
    assert_eq!(harness.pool.orphan_count(), 2);

    let accepted = harness
        .pool
        .process_transaction(Arc::clone(&tx_a), true, false, 1)
        .expect("accept chain");
    assert_eq!(accepted.len(), 3);
    assert_eq!(harness.pool.count(), 3);
    assert_eq!(harness.pool.orphan_count(), 0);
}

#[test]
fn low_fee_requires_priority() {
    let harness = harness();

    // Zero-fee spend of a fresh coin: almost no accumulated age.
    let young = OutPoint::new([0xdd; 32], 0);
    harness.seed_utxo(young, 100_000_000, 200);
    let tx_young = spend(&[young], &[(100_000_000, 1)]);
    let err = harness
        .pool
        .process_transaction(tx_young, false, false, 0)
        .unwrap_err();
    assert_eq!(rule_code(&err), RejectCode::InsufficientFee);

    // The same spend of an old coin carries enough priority.
    let old = OutPoint::new([0xde; 32], 0);
    harness.seed_utxo(old, 100_000_000, 1);
    let tx_old = spend(&[old], &[(100_000_000, 2)]);
    harness
        .pool
        .process_transaction(tx_old, false, false, 0)
        .expect("high priority free tx");
}

#[test]
fn free_tx_rate_limit() {
    let policy = Policy {
        free_tx_relay_limit: 0.0,
        ..Policy::default()
    };
    let harness = harness_with_policy(policy);

    let old = OutPoint::new([0xde; 32], 0);
    harness.seed_utxo(old, 100_000_000, 1);
    let tx = spend(&[old], &[(100_000_000, 2)]);

    // With rate limiting requested and a zero budget, the free
    // transaction is refused outright.
    let err = harness
        .pool
        .process_transaction(Arc::clone(&tx), false, true, 0)
        .unwrap_err();
    assert_eq!(rule_code(&err), RejectCode::InsufficientFee);

    // Without the rate limit the same transaction is fine.
    harness
        .pool
        .process_transaction(tx, false, false, 0)
        .expect("accept without rate limit");
}

#[test]
fn remove_with_redeemers_cascades() {
    let harness = harness();
    let funding = OutPoint::new([0xcc; 32], 0);
    harness.seed_utxo(funding, 100_000, 100);

    let tx_a = spend(&[funding], &[(90_000, 1)]);
    let tx_b = spend(&[OutPoint::new(tx_a.txid(), 0)], &[(80_000, 2)]);
    harness
        .pool
        .process_transaction(Arc::clone(&tx_a), false, false, 0)
        .expect("accept");
    harness
        .pool
        .process_transaction(Arc::clone(&tx_b), false, false, 0)
        .expect("accept");
    assert_eq!(harness.pool.count(), 2);

    harness.pool.remove_transaction(&tx_a, true);
    assert_eq!(harness.pool.count(), 0);
    assert!(harness.pool.check_spend(&funding).is_none());
    assert!(harness
        .pool
        .check_spend(&OutPoint::new(tx_a.txid(), 0))
        .is_none());
}

#[test]
fn block_double_spend_evicts_conflicts() {
    let harness = harness();
    let funding = OutPoint::new([0xcc; 32], 0);
    harness.seed_utxo(funding, 100_000, 100);

    let tx_pooled = spend(&[funding], &[(90_000, 1)]);
    let tx_child = spend(&[OutPoint::new(tx_pooled.txid(), 0)], &[(80_000, 2)]);
    harness
        .pool
        .process_transaction(Arc::clone(&tx_pooled), false, false, 0)
        .expect("accept");
    harness
        .pool
        .process_transaction(Arc::clone(&tx_child), false, false, 0)
        .expect("accept");

    // A block confirms a different spend of the funding outpoint.
    let tx_mined = spend(&[funding], &[(85_000, 9)]);
    harness.pool.remove_double_spends(&tx_mined);

    assert_eq!(harness.pool.count(), 0);
}

#[test]
fn fetch_input_utxos_blends_chain_and_pool() {
    let harness = harness();
    let funding = OutPoint::new([0xcc; 32], 0);
    harness.seed_utxo(funding, 100_000, 100);

    let tx_a = spend(&[funding], &[(90_000, 1)]);
    harness
        .pool
        .process_transaction(Arc::clone(&tx_a), false, false, 0)
        .expect("accept");

    let tx_b = spend(&[OutPoint::new(tx_a.txid(), 0)], &[(80_000, 2)]);
    let view = harness.pool.fetch_input_utxos(&tx_b).expect("view");

    let entry = view
        .lookup(&OutPoint::new(tx_a.txid(), 0))
        .expect("pool-resident parent output");
    assert_eq!(entry.amount(), 90_000);
    assert_eq!(entry.block_height(), cashd_chainstate::UNMINED_HEIGHT);
}

#[test]
fn remove_confirmed_keeps_children_and_promotes_orphans() {
    let harness = harness();
    let funding = OutPoint::new([0xcc; 32], 0);
    harness.seed_utxo(funding, 100_000, 100);

    let tx_a = spend(&[funding], &[(90_000, 1)]);
    let tx_b = spend(&[OutPoint::new(tx_a.txid(), 0)], &[(80_000, 2)]);
    harness
        .pool
        .process_transaction(Arc::clone(&tx_a), false, false, 0)
        .expect("accept");
    harness
        .pool
        .process_transaction(Arc::clone(&tx_b), false, false, 0)
        .expect("accept");

    // An orphan waits on a transaction the block will confirm.
    let mined_funding = OutPoint::new([0xcd; 32], 0);
    let tx_mined = spend(&[mined_funding], &[(60_000, 4)]);
    let orphan = spend(&[OutPoint::new(tx_mined.txid(), 0)], &[(50_000, 5)]);
    harness
        .pool
        .process_transaction(Arc::clone(&orphan), true, false, 3)
        .expect("stash orphan");

    // The block connects: the cache now carries the mined outputs, and
    // the pool is told to drain them.
    harness.seed_utxo(OutPoint::new(tx_mined.txid(), 0), 60_000, 201);
    let promoted = harness.pool.remove_confirmed(&tx_a);
    assert!(promoted.is_empty());
    let promoted = harness.pool.remove_confirmed(&tx_mined);

    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].tx.txid(), orphan.txid());
    // The mined parent left, its in-pool child survived, the orphan is
    // now pooled.
    assert!(!harness.pool.contains(&tx_a.txid()));
    assert!(harness.pool.contains(&tx_b.txid()));
    assert!(harness.pool.contains(&orphan.txid()));
    assert_eq!(harness.pool.orphan_count(), 0);
}

#[test]
fn orphans_conflicting_with_acceptance_are_dropped() {
    let harness = harness();
    let funding = OutPoint::new([0xbb; 32], 0);
    harness.seed_utxo(funding, 50_000, 100);

    let tx_parent = spend(&[funding], &[(40_000, 1)]);
    let parent_out = OutPoint::new(tx_parent.txid(), 0);

    // Two orphans race for the same parent output; only one can win.
    let orphan_a = spend(&[parent_out], &[(30_000, 2)]);
    let orphan_b = spend(&[parent_out], &[(29_000, 3)]);
    harness
        .pool
        .process_transaction(Arc::clone(&orphan_a), true, false, 1)
        .expect("stash");
    harness
        .pool
        .process_transaction(Arc::clone(&orphan_b), true, false, 1)
        .expect("stash");
    assert_eq!(harness.pool.orphan_count(), 2);

    let accepted = harness
        .pool
        .process_transaction(Arc::clone(&tx_parent), true, false, 1)
        .expect("accept parent");

    // The parent plus exactly one of the two orphans.
    assert_eq!(accepted.len(), 2);
    assert_eq!(harness.pool.count(), 2);
    // The loser is a now-definitive double spend and was purged.
    assert_eq!(harness.pool.orphan_count(), 0);
}
