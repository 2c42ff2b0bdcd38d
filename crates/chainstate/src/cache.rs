//! Write-back cache over the durable UTXO set.
//!
//! All mutation funnels through a single internal mutex; even lookups
//! take it because a miss writes a negative entry back into the map.
//! Durability is governed by the consistency marker: a flush first
//! records that it is in progress, then drains batches, then marks the
//! store consistent at the new best hash. Recovery rewinds to the last
//! consistent point and replays forward.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cashd_consensus::{Hash256, ZERO_HASH};
use cashd_log::{log_debug, log_info, log_trace, log_warn};
use cashd_primitives::block::Block;
use cashd_primitives::hash::hash_to_hex;
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::Transaction;
use cashd_script::standard::is_unspendable;
use cashd_storage::{Column, KeyValueStore, WriteBatch};

use crate::undo::{fetch_spend_journal, StxoRecord};
use crate::utxo::{outpoint_key, UtxoEntry, TF_FRESH, TF_MODIFIED, TF_SPENT};
use crate::view::{
    connect_block_transactions, disconnect_block_transactions, UtxoOverlay, UtxoView,
};
use crate::ChainStateError;

const CONSISTENCY_KEY: &[u8] = b"utxo_consistency";

/// Best-chain position a flush commits the on-disk state to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BestState {
    pub hash: Hash256,
    pub height: i32,
}

/// One block of the best chain, as seen by recovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockNode {
    pub hash: Hash256,
    pub height: i32,
}

/// Read access to the best chain's blocks and ancestry, supplied by the
/// surrounding chain manager during recovery.
pub trait BlockSource {
    fn block(&self, node: &BlockNode) -> Result<Block, ChainStateError>;
    fn parent(&self, node: &BlockNode) -> Result<Option<BlockNode>, ChainStateError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    /// Flush unconditionally.
    Required,
    /// Flush only when the cache exceeds its memory budget.
    IfNeeded,
    /// Flush when the cache is close to its budget; called on a timer.
    Periodic,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsistencyStatus {
    Empty,
    Consistent(Hash256),
    FlushOngoing(Hash256),
}

#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub max_memory_bytes: u64,
    pub batch_entries: usize,
    pub batch_blocks: usize,
    pub periodic_threshold_pct: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 256 * 1024 * 1024,
            batch_entries: 200_000,
            batch_blocks: 50,
            periodic_threshold_pct: 90,
        }
    }
}

struct CacheInner {
    /// `None` values are negative entries: the store was consulted and
    /// holds nothing for that outpoint.
    entries: HashMap<OutPoint, Option<UtxoEntry>>,
    total_entry_memory: u64,
    last_flush_hash: Hash256,
    flush_in_progress: bool,
}

impl CacheInner {
    fn total_memory_usage(&self) -> u64 {
        // Keys plus map slot pointers plus the entries themselves.
        let entry_count = self.entries.len() as u64;
        entry_count * 36 + entry_count * 8 + self.total_entry_memory
    }
}

pub struct UtxoCache<S> {
    store: Arc<S>,
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

/// The cache with its lock held, viewed as a UTXO overlay with store
/// read-through.
struct CacheView<'a, S> {
    store: &'a S,
    inner: &'a mut CacheInner,
}

impl<S: KeyValueStore> UtxoOverlay for CacheView<'_, S> {
    fn get_entry(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        if let Some(cached) = self.inner.entries.get(outpoint) {
            return Ok(cached.clone());
        }

        let fetched = match self.store.get(Column::Utxo, &outpoint_key(outpoint))? {
            Some(bytes) => Some(UtxoEntry::deserialize(&bytes)?),
            None => None,
        };

        // Misses are cached too, so the next lookup for the same
        // outpoint skips the store.
        let usage = fetched.as_ref().map(UtxoEntry::memory_usage).unwrap_or(0);
        self.inner.entries.insert(*outpoint, fetched.clone());
        self.inner.total_entry_memory += usage;

        Ok(fetched)
    }

    fn add_entry(
        &mut self,
        outpoint: OutPoint,
        mut entry: UtxoEntry,
        overwrite: bool,
    ) -> Result<(), ChainStateError> {
        if is_unspendable(entry.script()) {
            return Ok(());
        }

        let cached = self.inner.entries.get(&outpoint);
        let cached_usage = cached
            .and_then(|slot| slot.as_ref())
            .map(UtxoEntry::memory_usage)
            .unwrap_or(0);
        let cached_is_nil = !matches!(cached, Some(Some(_)));

        if !overwrite {
            // Not a consensus check: an unspent entry must never be
            // silently replaced outside of recovery replay.
            if let Some(Some(existing)) = cached {
                if !existing.is_spent() {
                    log_warn!(
                        "utxo entry {outpoint} attempted to overwrite existing unspent entry"
                    );
                    return Ok(());
                }
            }

            // The store has never seen this entry, so a spend before the
            // next flush can drop it without a database write.
            if cached_is_nil && !entry.is_modified() {
                entry.flags |= TF_FRESH;
            }
        }

        entry.flags |= TF_MODIFIED;
        self.inner.total_entry_memory = self
            .inner
            .total_entry_memory
            .saturating_sub(cached_usage)
            .saturating_add(entry.memory_usage());
        self.inner.entries.insert(outpoint, Some(entry));
        Ok(())
    }

    fn spend_entry(
        &mut self,
        outpoint: &OutPoint,
        if_absent: Option<UtxoEntry>,
    ) -> Result<(), ChainStateError> {
        let is_nil = !matches!(self.inner.entries.get(outpoint), Some(Some(_)));
        if is_nil {
            match if_absent {
                Some(entry) => self.add_entry(*outpoint, entry, false)?,
                None => return Ok(()),
            }
        }

        let Some(Some(entry)) = self.inner.entries.get_mut(outpoint) else {
            return Ok(());
        };
        if entry.is_spent() {
            return Ok(());
        }

        if entry.is_fresh() {
            // Never persisted: a negative marker is enough, no database
            // delete will be needed at flush time.
            let usage = entry.memory_usage();
            self.inner.entries.insert(*outpoint, None);
            self.inner.total_entry_memory = self.inner.total_entry_memory.saturating_sub(usage);
            return Ok(());
        }

        entry.flags |= TF_SPENT | TF_MODIFIED;
        // The script is dead weight once spent; reclaim it.
        let before = entry.memory_usage();
        entry.script = Vec::new();
        let after = entry.memory_usage();
        self.inner.total_entry_memory = self
            .inner
            .total_entry_memory
            .saturating_sub(before)
            .saturating_add(after);
        Ok(())
    }
}

impl<S: KeyValueStore> UtxoCache<S> {
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_entry_memory: 0,
                last_flush_hash: ZERO_HASH,
                flush_in_progress: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("utxo cache lock")
    }

    pub fn total_memory_usage(&self) -> u64 {
        self.lock().total_memory_usage()
    }

    pub fn last_flush_hash(&self) -> Hash256 {
        self.lock().last_flush_hash
    }

    pub fn flush_in_progress(&self) -> bool {
        self.lock().flush_in_progress
    }

    pub fn consistency_status(&self) -> Result<ConsistencyStatus, ChainStateError> {
        read_consistency(self.store.as_ref())
    }

    /// Returns a clone of the entry for the given outpoint, or `None`
    /// when the UTXO set has no record of it. Misses are negative-cached.
    pub fn fetch_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        let mut inner = self.lock();
        let mut cache = CacheView {
            store: self.store.as_ref(),
            inner: &mut inner,
        };
        cache.get_entry(outpoint)
    }

    /// Builds a view holding every input referenced by `tx` plus the
    /// outpoints `tx` itself would create, so the caller can detect the
    /// recreation of an existing unspent output.
    pub fn fetch_tx_view(&self, tx: &Transaction) -> Result<UtxoView, ChainStateError> {
        let mut inner = self.lock();
        let mut cache = CacheView {
            store: self.store.as_ref(),
            inner: &mut inner,
        };

        let mut view = UtxoView::new();
        if !tx.is_coinbase() {
            for input in &tx.vin {
                let entry = cache.get_entry(&input.prevout)?;
                view.entries.insert(input.prevout, entry);
            }
        }
        let txid = tx.txid();
        for index in 0..tx.vout.len() as u32 {
            let outpoint = OutPoint::new(txid, index);
            let entry = cache.get_entry(&outpoint)?;
            view.entries.insert(outpoint, entry);
        }
        Ok(view)
    }

    /// Merges a view back into the cache, then prunes the view.
    pub fn commit(&self, view: &mut UtxoView) -> Result<(), ChainStateError> {
        let mut inner = self.lock();
        let mut cache = CacheView {
            store: self.store.as_ref(),
            inner: &mut inner,
        };

        for (outpoint, view_entry) in view.entries.iter() {
            let Some(view_entry) = view_entry else {
                continue;
            };
            if !view_entry.is_modified() && !view_entry.is_fresh() {
                continue;
            }

            // Work on our own copy; the view entry can be mutated later.
            let ours = cache
                .inner
                .entries
                .get(outpoint)
                .cloned()
                .flatten()
                .unwrap_or_else(|| view_entry.clone());

            if view_entry.is_spent() {
                cache.spend_entry(outpoint, Some(ours))?;
                continue;
            }

            // A reorg can remove a UTXO and a later block recreate it;
            // going spent -> unspent requires replacing our record.
            let (ours, overwrite) = if ours.is_spent() && !view_entry.is_spent() {
                (view_entry.clone(), true)
            } else {
                (ours, false)
            };

            cache.add_entry(*outpoint, ours, overwrite)?;
        }

        view.prune();
        Ok(())
    }

    /// Applies all outputs then all inputs of a block directly to the
    /// cache, appending each spent pre-image to `stxos` in tx/input
    /// order. The caller persists the spend journal and serializes
    /// connects via the chain lock.
    pub fn connect_block(
        &self,
        block: &Block,
        height: i32,
        stxos: &mut Vec<StxoRecord>,
    ) -> Result<(), ChainStateError> {
        let mut inner = self.lock();
        let mut cache = CacheView {
            store: self.store.as_ref(),
            inner: &mut inner,
        };
        connect_block_transactions(&mut cache, block, height, Some(stxos), false)
    }

    /// Reverses a connected block using its spend journal.
    pub fn disconnect_block(
        &self,
        block: &Block,
        height: i32,
        stxos: &[StxoRecord],
    ) -> Result<(), ChainStateError> {
        let mut inner = self.lock();
        let mut cache = CacheView {
            store: self.store.as_ref(),
            inner: &mut inner,
        };
        disconnect_block_transactions(&mut cache, block, height, stxos)
    }

    /// Write-back according to the flush mode's memory threshold.
    pub fn flush(&self, mode: FlushMode, best: &BestState) -> Result<(), ChainStateError> {
        let mut inner = self.lock();
        let threshold = match mode {
            FlushMode::Required => 0,
            FlushMode::IfNeeded => self.config.max_memory_bytes,
            FlushMode::Periodic => {
                self.config.periodic_threshold_pct * self.config.max_memory_bytes / 100
            }
        };
        if inner.total_memory_usage() > threshold {
            self.flush_locked(&mut inner, best)?;
        }
        Ok(())
    }

    fn flush_locked(
        &self,
        inner: &mut CacheInner,
        best: &BestState,
    ) -> Result<(), ChainStateError> {
        // Re-flushing at the same best hash is a no-op, except for the
        // all-zero sentinel used while bootstrapping from a UTXO
        // snapshot.
        if best.hash == inner.last_flush_hash && best.hash != ZERO_HASH {
            return Ok(());
        }

        let total_mib = inner.total_memory_usage() / (1024 * 1024) + 1;
        log_info!(
            "Flushing UTXO cache of ~{total_mib} MiB to disk. For large sizes, \
             this can take up to several minutes..."
        );

        // Record that a flush is underway so a crash in the middle is
        // recoverable.
        write_consistency(
            self.store.as_ref(),
            ConsistencyStatus::FlushOngoing(inner.last_flush_hash),
        )?;

        inner.flush_in_progress = true;
        let result = self.flush_batches(inner);
        inner.flush_in_progress = false;
        result?;

        write_consistency(self.store.as_ref(), ConsistencyStatus::Consistent(best.hash))?;
        inner.last_flush_hash = best.hash;
        log_debug!("Done flushing UTXO cache to disk");
        Ok(())
    }

    fn flush_batches(&self, inner: &mut CacheInner) -> Result<(), ChainStateError> {
        while !inner.entries.is_empty() {
            log_trace!("Flushing {} more entries...", inner.entries.len());

            let mut batch = WriteBatch::new();
            let mut evict: Vec<OutPoint> = Vec::new();
            let mut batched = 0usize;
            for (outpoint, entry) in inner.entries.iter() {
                match entry {
                    // Negative and pristine entries need no write; they
                    // are evicted without counting against the batch.
                    None => evict.push(*outpoint),
                    Some(entry) if !entry.is_modified() => evict.push(*outpoint),
                    Some(entry) => {
                        if entry.is_spent() {
                            batch.delete(Column::Utxo, outpoint_key(outpoint));
                        } else {
                            batch.put(Column::Utxo, outpoint_key(outpoint), entry.serialize());
                        }
                        evict.push(*outpoint);
                        batched += 1;
                        if batched >= self.config.batch_entries {
                            break;
                        }
                    }
                }
            }

            self.store.write_batch(&batch)?;

            for outpoint in evict {
                if let Some(entry) = inner.entries.remove(&outpoint) {
                    let usage = entry.map(|e| e.memory_usage()).unwrap_or(0);
                    inner.total_entry_memory =
                        inner.total_entry_memory.saturating_sub(usage);
                }
            }
        }
        Ok(())
    }

    /// Checks the consistency marker on startup and replays blocks when
    /// the on-disk UTXO set lags or was mid-flush. The best chain must
    /// not change while this runs. `interrupt` is polled between
    /// batches.
    pub fn init_consistent_state(
        &self,
        tip: &BlockNode,
        fast_sync: bool,
        source: &dyn BlockSource,
        interrupt: &AtomicBool,
    ) -> Result<(), ChainStateError> {
        let mut inner = self.lock();
        let status = read_consistency(self.store.as_ref())?;

        if fast_sync {
            // A non-zero marker means a previous run was not in
            // fast-sync mode, so the UTXO bucket is dirty; reset it and
            // let the snapshot download write over a clean slate.
            let marker_hash = match status {
                ConsistencyStatus::Empty => ZERO_HASH,
                ConsistencyStatus::Consistent(hash) => hash,
                ConsistencyStatus::FlushOngoing(hash) => hash,
            };
            if marker_hash != ZERO_HASH {
                self.store.clear_column(Column::Utxo)?;
            }
            return Ok(());
        }

        log_trace!("UTXO cache consistency status from disk: {status:?}");

        let status_hash = match status {
            ConsistencyStatus::Empty => {
                // First run against this store; the existing UTXO set
                // is presumed to match the tip.
                log_debug!(
                    "Database didn't specify UTXO state consistency: consistent to best \
                     chain tip ({})",
                    hash_to_hex(&tip.hash)
                );
                inner.last_flush_hash = tip.hash;
                write_consistency(
                    self.store.as_ref(),
                    ConsistencyStatus::Consistent(tip.hash),
                )?;
                return Ok(());
            }
            ConsistencyStatus::Consistent(hash) if hash == tip.hash => {
                log_debug!(
                    "UTXO state consistent ({}:{})",
                    tip.height,
                    hash_to_hex(&tip.hash)
                );
                inner.last_flush_hash = hash;
                return Ok(());
            }
            ConsistencyStatus::Consistent(hash) => hash,
            ConsistencyStatus::FlushOngoing(hash) => hash,
        };

        inner.last_flush_hash = status_hash;

        log_info!(
            "Reconstructing UTXO state after unclean shutdown. This may take a long time..."
        );

        // Locate the consistency point on the best chain, collecting the
        // nodes above it for the replay.
        let mut attach_nodes: Vec<BlockNode> = Vec::new();
        let mut status_node: Option<BlockNode> = None;
        let mut walk = *tip;
        loop {
            if walk.hash == status_hash {
                status_node = Some(walk);
                break;
            }
            let parent = source.parent(&walk)?;
            attach_nodes.push(walk);
            match parent {
                Some(parent) => walk = parent,
                None => break,
            }
        }
        let status_node = status_node.ok_or_else(|| {
            ChainStateError::Assertion(format!(
                "last utxo consistency status contains hash that is not in best chain: {}",
                hash_to_hex(&status_hash)
            ))
        })?;
        attach_nodes.reverse();

        log_debug!(
            "Rolling back {} blocks to rebuild the UTXO state...",
            tip.height - status_node.height
        );

        let mut cursor = *tip;
        while cursor.height > status_node.height {
            let mut batched = 0usize;
            while cursor.height > status_node.height && batched < self.config.batch_blocks {
                log_trace!(
                    "Rolling back {} more blocks...",
                    cursor.height - status_node.height
                );
                let block = source.block(&cursor)?;
                let stxos = fetch_spend_journal(self.store.as_ref(), &cursor.hash)?;
                {
                    let mut cache = CacheView {
                        store: self.store.as_ref(),
                        inner: &mut inner,
                    };
                    disconnect_block_transactions(&mut cache, &block, cursor.height, &stxos)?;
                }
                cursor = source.parent(&cursor)?.ok_or_else(|| {
                    ChainStateError::Assertion(format!(
                        "missing ancestry while rolling back {}",
                        hash_to_hex(&cursor.hash)
                    ))
                })?;
                batched += 1;
            }

            if interrupt.load(Ordering::Relaxed) {
                log_warn!("UTXO state reconstruction interrupted");
                return Err(ChainStateError::Interrupted);
            }
        }

        // Persist the rewound state so interrupted recovery keeps its
        // progress.
        self.flush_locked(
            &mut inner,
            &BestState {
                hash: status_hash,
                height: status_node.height,
            },
        )?;

        if attach_nodes.is_empty() {
            // Nothing above the consistency point; just settle the
            // marker at the tip.
            write_consistency(self.store.as_ref(), ConsistencyStatus::Consistent(tip.hash))?;
            inner.last_flush_hash = tip.hash;
            log_debug!("UTXO state reconstruction done");
            return Ok(());
        }

        log_debug!(
            "Replaying {} blocks to rebuild UTXO state...",
            attach_nodes.len()
        );

        // Replay forward from the consistency point to the tip,
        // flushing after every batch so an interruption resumes from
        // the last flushed batch rather than the beginning.
        for chunk in attach_nodes.chunks(self.config.batch_blocks) {
            for node in chunk {
                log_trace!("Replaying block {}...", hash_to_hex(&node.hash));
                let block = source.block(node)?;
                let mut cache = CacheView {
                    store: self.store.as_ref(),
                    inner: &mut inner,
                };
                // No stxos are collected and existing entries may be
                // overwritten while replaying.
                connect_block_transactions(&mut cache, &block, node.height, None, true)?;
            }

            let last = chunk.last().expect("chunks are non-empty");
            self.flush_locked(
                &mut inner,
                &BestState {
                    hash: last.hash,
                    height: last.height,
                },
            )?;

            if interrupt.load(Ordering::Relaxed) {
                log_warn!("UTXO state reconstruction interrupted");
                return Err(ChainStateError::Interrupted);
            }
        }

        log_debug!("UTXO state reconstruction done");
        Ok(())
    }
}

fn read_consistency<S: KeyValueStore>(store: &S) -> Result<ConsistencyStatus, ChainStateError> {
    let Some(bytes) = store.get(Column::Meta, CONSISTENCY_KEY)? else {
        return Ok(ConsistencyStatus::Empty);
    };
    if bytes.len() != 33 {
        return Err(ChainStateError::Assertion(
            "corrupt utxo consistency marker".to_string(),
        ));
    }
    let mut hash: Hash256 = [0u8; 32];
    hash.copy_from_slice(&bytes[1..33]);
    match bytes[0] {
        0 => Ok(ConsistencyStatus::Empty),
        1 => Ok(ConsistencyStatus::Consistent(hash)),
        2 => Ok(ConsistencyStatus::FlushOngoing(hash)),
        _ => Err(ChainStateError::Assertion(
            "unknown utxo consistency status".to_string(),
        )),
    }
}

fn write_consistency<S: KeyValueStore>(
    store: &S,
    status: ConsistencyStatus,
) -> Result<(), ChainStateError> {
    let (code, hash) = match status {
        ConsistencyStatus::Empty => (0u8, ZERO_HASH),
        ConsistencyStatus::Consistent(hash) => (1u8, hash),
        ConsistencyStatus::FlushOngoing(hash) => (2u8, hash),
    };
    let mut value = Vec::with_capacity(33);
    value.push(code);
    value.extend_from_slice(&hash);
    store.put(Column::Meta, CONSISTENCY_KEY, &value)?;
    Ok(())
}
