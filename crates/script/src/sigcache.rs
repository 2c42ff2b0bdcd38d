//! Memoization of successful signature checks.
//!
//! Keyed by the sighash, with the signature and public key stored so a
//! hit is only reported for the exact triple that validated before.
//! Shared between the mempool and the block connector, so entries added
//! during relay make block validation cheaper.

use std::collections::HashMap;
use std::sync::RwLock;

use cashd_consensus::Hash256;

#[derive(Clone, Debug, Eq, PartialEq)]
struct SigCacheEntry {
    sig: Vec<u8>,
    pubkey: Vec<u8>,
}

pub struct SigCache {
    valid_sigs: RwLock<HashMap<Hash256, SigCacheEntry>>,
    max_entries: usize,
}

impl SigCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            valid_sigs: RwLock::new(HashMap::with_capacity(max_entries.min(1 << 16))),
            max_entries,
        }
    }

    pub fn exists(&self, sig_hash: &Hash256, sig: &[u8], pubkey: &[u8]) -> bool {
        let guard = self.valid_sigs.read().expect("sig cache lock");
        guard
            .get(sig_hash)
            .map(|entry| entry.sig == sig && entry.pubkey == pubkey)
            .unwrap_or(false)
    }

    /// Records a triple that passed verification. When the cache is full
    /// an arbitrary existing entry is evicted; any victim is as good as
    /// any other here.
    pub fn add(&self, sig_hash: Hash256, sig: &[u8], pubkey: &[u8]) {
        if self.max_entries == 0 {
            return;
        }
        let mut guard = self.valid_sigs.write().expect("sig cache lock");
        if guard.len() + 1 > self.max_entries {
            let victim = guard.keys().next().copied();
            if let Some(victim) = victim {
                guard.remove(&victim);
            }
        }
        guard.insert(
            sig_hash,
            SigCacheEntry {
                sig: sig.to_vec(),
                pubkey: pubkey.to_vec(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.valid_sigs.read().expect("sig cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
