//! Cache of per-transaction sighash midstates.
//!
//! The BIP143-style digest reuses three intermediate hashes across every
//! input of a transaction; computing them once per transaction turns an
//! O(N^2) sighash cost into O(N).

use std::collections::HashMap;
use std::sync::RwLock;

use cashd_consensus::Hash256;
use cashd_primitives::encoding::{Encodable, Encoder};
use cashd_primitives::hash::sha256d;
use cashd_primitives::transaction::Transaction;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxSigHashes {
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
}

impl TxSigHashes {
    pub fn new(tx: &Transaction) -> Self {
        Self {
            hash_prevouts: calc_hash_prevouts(tx),
            hash_sequence: calc_hash_sequence(tx),
            hash_outputs: calc_hash_outputs(tx),
        }
    }
}

pub fn calc_hash_prevouts(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::new();
    for input in &tx.vin {
        input.prevout.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

pub fn calc_hash_sequence(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::new();
    for input in &tx.vin {
        encoder.write_u32_le(input.sequence);
    }
    sha256d(&encoder.into_inner())
}

pub fn calc_hash_outputs(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::new();
    for output in &tx.vout {
        output.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

#[derive(Default)]
pub struct HashCache {
    sig_hashes: RwLock<HashMap<Hash256, TxSigHashes>>,
}

impl HashCache {
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            sig_hashes: RwLock::new(HashMap::with_capacity(capacity_hint)),
        }
    }

    pub fn add_sig_hashes(&self, tx: &Transaction) {
        let hashes = TxSigHashes::new(tx);
        let mut guard = self.sig_hashes.write().expect("hash cache lock");
        guard.insert(tx.txid(), hashes);
    }

    pub fn contains_hashes(&self, txid: &Hash256) -> bool {
        let guard = self.sig_hashes.read().expect("hash cache lock");
        guard.contains_key(txid)
    }

    pub fn get_sig_hashes(&self, txid: &Hash256) -> Option<TxSigHashes> {
        let guard = self.sig_hashes.read().expect("hash cache lock");
        guard.get(txid).copied()
    }

    pub fn purge_sig_hashes(&self, txid: &Hash256) {
        let mut guard = self.sig_hashes.write().expect("hash cache lock");
        guard.remove(txid);
    }
}
