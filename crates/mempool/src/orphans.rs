//! The orphan pool: transactions whose parents are not yet known,
//! indexed by the outpoints they are waiting on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cashd_consensus::Hash256;
use cashd_log::log_debug;
use cashd_primitives::hash::hash_to_hex;
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::Transaction;

use crate::error::{RejectCode, TxRuleError};
use crate::pool::Tag;

/// How long an orphan may wait for its parents before an expiry scan
/// evicts it.
pub const ORPHAN_TTL_SECS: u64 = 15 * 60;

/// Minimum interval between expiry scans; scans piggyback on orphan
/// insertion rather than running on a timer.
pub const ORPHAN_EXPIRE_SCAN_INTERVAL_SECS: u64 = 5 * 60;

pub(crate) struct OrphanTx {
    pub tx: Arc<Transaction>,
    pub tag: Tag,
    pub expires_at: u64,
}

pub(crate) struct OrphanPool {
    orphans: HashMap<Hash256, OrphanTx>,
    by_prev: HashMap<OutPoint, HashSet<Hash256>>,
    next_expire_scan: u64,
    max_orphans: usize,
    max_orphan_size: usize,
}

impl OrphanPool {
    pub fn new(max_orphans: usize, max_orphan_size: usize, now: u64) -> Self {
        Self {
            orphans: HashMap::new(),
            by_prev: HashMap::new(),
            next_expire_scan: now + ORPHAN_EXPIRE_SCAN_INTERVAL_SECS,
            max_orphans,
            max_orphan_size,
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    /// Orphans waiting on the given outpoint. Usually one, but double
    /// spends are deliberately kept so a malicious child cannot make an
    /// output unspendable for honest ones.
    pub fn redeemers_of(&self, outpoint: &OutPoint) -> Vec<(Hash256, Arc<Transaction>)> {
        let Some(children) = self.by_prev.get(outpoint) else {
            return Vec::new();
        };
        children
            .iter()
            .filter_map(|txid| {
                self.orphans
                    .get(txid)
                    .map(|orphan| (*txid, Arc::clone(&orphan.tx)))
            })
            .collect()
    }

    /// Removes an orphan. With `remove_redeemers` set, every orphan
    /// spending one of its outputs is removed recursively too.
    pub fn remove(&mut self, txid: &Hash256, remove_redeemers: bool) {
        let Some(orphan) = self.orphans.remove(txid) else {
            return;
        };

        for input in &orphan.tx.vin {
            if let Some(children) = self.by_prev.get_mut(&input.prevout) {
                children.remove(txid);
                if children.is_empty() {
                    self.by_prev.remove(&input.prevout);
                }
            }
        }

        if remove_redeemers {
            for index in 0..orphan.tx.vout.len() as u32 {
                let outpoint = OutPoint::new(*txid, index);
                let children: Vec<Hash256> = self
                    .by_prev
                    .get(&outpoint)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                for child in children {
                    self.remove(&child, true);
                }
            }
        }
    }

    /// Removes every orphan that conflicts with an input of `tx`, plus
    /// their descendants; once `tx` is pooled those orphans are
    /// guaranteed double spends.
    pub fn remove_double_spends(&mut self, tx: &Transaction) {
        for input in &tx.vin {
            let children: Vec<Hash256> = self
                .by_prev
                .get(&input.prevout)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for child in children {
                self.remove(&child, true);
            }
        }
    }

    /// Removes all orphans carrying the given introducing-peer tag and
    /// their descendants, returning how many were evicted directly.
    pub fn remove_by_tag(&mut self, tag: Tag) -> u64 {
        let tagged: Vec<Hash256> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.tag == tag)
            .map(|(txid, _)| *txid)
            .collect();
        let mut evicted = 0u64;
        for txid in tagged {
            if self.orphans.contains_key(&txid) {
                self.remove(&txid, true);
                evicted += 1;
            }
        }
        evicted
    }

    /// Expires old orphans when the scan interval has elapsed, then
    /// evicts an arbitrary entry if a new orphan would overflow the
    /// limit. Map iteration order decides the victim; targeting a
    /// specific eviction would require a second pre-image of the hash.
    fn limit(&mut self, now: u64) {
        if now > self.next_expire_scan {
            let before = self.orphans.len();
            let expired: Vec<Hash256> = self
                .orphans
                .iter()
                .filter(|(_, orphan)| now > orphan.expires_at)
                .map(|(txid, _)| *txid)
                .collect();
            for txid in expired {
                // Remove descendants as well: parents this old are very
                // unlikely to ever materialize.
                self.remove(&txid, true);
            }

            self.next_expire_scan = now + ORPHAN_EXPIRE_SCAN_INTERVAL_SECS;

            let evicted = before.saturating_sub(self.orphans.len());
            if evicted > 0 {
                log_debug!(
                    "Expired {evicted} orphans (remaining: {})",
                    self.orphans.len()
                );
            }
        }

        if self.orphans.len() + 1 <= self.max_orphans {
            return;
        }

        let victim = self.orphans.keys().next().copied();
        if let Some(victim) = victim {
            // Keep the victim's redeemers; they may become useful again
            // shortly.
            self.remove(&victim, false);
        }
    }

    fn add(&mut self, tx: Arc<Transaction>, tag: Tag, now: u64) {
        if self.max_orphans == 0 {
            return;
        }

        self.limit(now);

        let txid = tx.txid();
        for input in &tx.vin {
            self.by_prev
                .entry(input.prevout)
                .or_default()
                .insert(txid);
        }
        self.orphans.insert(
            txid,
            OrphanTx {
                tx,
                tag,
                expires_at: now + ORPHAN_TTL_SECS,
            },
        );

        log_debug!(
            "Stored orphan transaction {} (total: {})",
            hash_to_hex(&txid),
            self.orphans.len()
        );
    }

    /// Admits an orphan unless it exceeds the per-transaction size cap.
    pub fn maybe_add(
        &mut self,
        tx: Arc<Transaction>,
        tag: Tag,
        now: u64,
    ) -> Result<(), TxRuleError> {
        let serialized_len = tx.serialized_size();
        if serialized_len > self.max_orphan_size {
            return Err(TxRuleError::new(
                RejectCode::Nonstandard,
                format!(
                    "orphan transaction size of {serialized_len} bytes is larger than max \
                     allowed size of {} bytes",
                    self.max_orphan_size
                ),
            ));
        }
        self.add(tx, tag, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashd_primitives::transaction::{TxIn, TxOut};

    fn orphan_spending(parents: &[(Hash256, u32)], salt: u8) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: 2,
            vin: parents
                .iter()
                .map(|(hash, index)| TxIn {
                    prevout: OutPoint::new(*hash, *index),
                    script_sig: vec![salt],
                    sequence: u32::MAX,
                })
                .collect(),
            vout: vec![TxOut::new(1_000, vec![0x51, salt])],
            lock_time: 0,
        })
    }

    fn pool() -> OrphanPool {
        OrphanPool::new(100, 100_000, 0)
    }

    #[test]
    fn add_and_back_index() {
        let mut pool = pool();
        let orphan = orphan_spending(&[([1u8; 32], 0), ([2u8; 32], 3)], 0);
        let txid = orphan.txid();
        pool.maybe_add(Arc::clone(&orphan), 1, 0).expect("add");

        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&txid));
        assert_eq!(pool.redeemers_of(&OutPoint::new([1u8; 32], 0)).len(), 1);
        assert_eq!(pool.redeemers_of(&OutPoint::new([2u8; 32], 3)).len(), 1);

        pool.remove(&txid, false);
        assert_eq!(pool.len(), 0);
        assert!(pool.redeemers_of(&OutPoint::new([1u8; 32], 0)).is_empty());
    }

    #[test]
    fn oversized_orphans_rejected() {
        let mut pool = OrphanPool::new(100, 10, 0);
        let orphan = orphan_spending(&[([1u8; 32], 0)], 0);
        let err = pool.maybe_add(orphan, 1, 0).unwrap_err();
        assert_eq!(err.code, RejectCode::Nonstandard);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn capacity_evicts_an_existing_orphan() {
        let mut pool = OrphanPool::new(3, 100_000, 0);
        for salt in 0..4u8 {
            let orphan = orphan_spending(&[([salt + 1; 32], 0)], salt);
            pool.maybe_add(orphan, 1, 0).expect("add");
        }
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn ttl_eviction_on_scan() {
        let mut pool = pool();
        let first = orphan_spending(&[([1u8; 32], 0)], 0);
        pool.maybe_add(Arc::clone(&first), 1, 0).expect("add");

        // Sixteen minutes later a new orphan arrives; the scan interval
        // has passed and the first orphan has outlived its TTL.
        let now = 16 * 60;
        let second = orphan_spending(&[([2u8; 32], 0)], 1);
        pool.maybe_add(Arc::clone(&second), 1, now).expect("add");

        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&first.txid()));
        assert!(pool.contains(&second.txid()));
    }

    #[test]
    fn expiry_takes_descendants_along() {
        let mut pool = pool();
        let parent = orphan_spending(&[([1u8; 32], 0)], 0);
        pool.maybe_add(Arc::clone(&parent), 1, 0).expect("add");

        // A child arrives later, spending the expired parent's output.
        let child = orphan_spending(&[(parent.txid(), 0)], 1);
        pool.maybe_add(Arc::clone(&child), 1, 14 * 60).expect("add");

        // The next insert triggers a scan that expires the parent; the
        // child goes with it even though its own TTL has time left.
        let probe = orphan_spending(&[([3u8; 32], 0)], 2);
        pool.maybe_add(Arc::clone(&probe), 1, 20 * 60).expect("add");

        assert!(!pool.contains(&parent.txid()));
        assert!(!pool.contains(&child.txid()));
        assert!(pool.contains(&probe.txid()));
    }

    #[test]
    fn tag_eviction_removes_descendants() {
        let mut pool = pool();
        let parent = orphan_spending(&[([1u8; 32], 0)], 0);
        let child = orphan_spending(&[(parent.txid(), 0)], 1);
        let other = orphan_spending(&[([2u8; 32], 0)], 2);

        pool.maybe_add(Arc::clone(&parent), 7, 0).expect("add");
        pool.maybe_add(Arc::clone(&child), 9, 0).expect("add");
        pool.maybe_add(Arc::clone(&other), 8, 0).expect("add");

        let evicted = pool.remove_by_tag(7);
        assert_eq!(evicted, 1);
        assert!(!pool.contains(&parent.txid()));
        // The child was tagged differently but descends from the
        // evicted parent.
        assert!(!pool.contains(&child.txid()));
        assert!(pool.contains(&other.txid()));
    }

    #[test]
    fn double_spend_removal() {
        let mut pool = pool();
        let contested = ([5u8; 32], 0);
        let orphan_a = orphan_spending(&[contested], 0);
        let orphan_b = orphan_spending(&[contested], 1);
        pool.maybe_add(Arc::clone(&orphan_a), 1, 0).expect("add");
        pool.maybe_add(Arc::clone(&orphan_b), 1, 0).expect("add");
        assert_eq!(pool.redeemers_of(&OutPoint::new([5u8; 32], 0)).len(), 2);

        // An accepted pool transaction spends the contested outpoint.
        let winner = orphan_spending(&[contested], 2);
        pool.remove_double_spends(&winner);

        assert_eq!(pool.len(), 0);
    }
}
