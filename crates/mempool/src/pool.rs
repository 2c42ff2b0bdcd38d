//! The transaction pool and its acceptance pipeline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use cashd_chainstate::{
    check_transaction_inputs, check_transaction_sanity, sequence_lock_active, UtxoCache, UtxoView,
    UNMINED_HEIGHT,
};
use cashd_consensus::{ChainParams, Hash256};
use cashd_log::{log_debug, log_trace};
use cashd_primitives::hash::hash_to_hex;
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::Transaction;
use cashd_script::{
    HashCache, SigCache, SCRIPT_ALLOW_CASH_TOKENS, SCRIPT_ALLOW_MAY2025,
    SCRIPT_ALLOW_MAY2025_STANDARD_ONLY, SCRIPT_VERIFY_INPUT_SIG_CHECKS, STANDARD_VERIFY_FLAGS,
};
use cashd_storage::KeyValueStore;

use crate::adapters::{AddrIndexAdapter, ChainAdapter, FeeEstimatorAdapter, ScriptValidator};
use crate::error::{MempoolError, RejectCode};
use crate::orphans::OrphanPool;
use crate::policy::{
    calc_min_required_relay_fee, calc_priority, check_inputs_standard,
    check_transaction_standard, Policy, DEFAULT_BLOCK_PRIORITY_SIZE, MIN_HIGH_PRIORITY,
};

/// Identifies the peer that introduced an orphan, so one peer's orphans
/// can be evicted in bulk.
pub type Tag = u64;

/// A pool transaction with its acceptance metadata.
#[derive(Clone, Debug)]
pub struct TxDesc {
    pub tx: Arc<Transaction>,
    /// Unix time the transaction entered the pool.
    pub added: u64,
    /// Best chain height when it was accepted.
    pub height: i32,
    pub fee: i64,
    pub fee_per_kb: i64,
    pub starting_priority: f64,
}

pub struct PoolConfig<S> {
    pub policy: Policy,
    pub chain_params: ChainParams,
    pub utxo_cache: Arc<UtxoCache<S>>,
    pub chain: Arc<dyn ChainAdapter>,
    pub script_validator: Arc<dyn ScriptValidator>,
    pub sig_cache: Arc<SigCache>,
    pub hash_cache: Arc<HashCache>,
    pub addr_index: Option<Arc<dyn AddrIndexAdapter>>,
    pub fee_estimator: Option<Arc<dyn FeeEstimatorAdapter>>,
}

struct PoolInner {
    pool: HashMap<Hash256, TxDesc>,
    /// Every input of every pool transaction, mapped to its spender.
    outpoints: HashMap<OutPoint, Hash256>,
    orphans: OrphanPool,
    /// Exponentially decaying byte total for free-transaction rate
    /// limiting.
    penny_total: f64,
    last_penny_unix: i64,
}

pub struct TxPool<S> {
    last_updated: AtomicI64,
    cfg: PoolConfig<S>,
    inner: Mutex<PoolInner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

impl<S: KeyValueStore> TxPool<S> {
    pub fn new(cfg: PoolConfig<S>) -> Self {
        let now = now_secs();
        let orphans = OrphanPool::new(
            cfg.policy.max_orphan_txs,
            cfg.policy.max_orphan_tx_size,
            now,
        );
        Self {
            last_updated: AtomicI64::new(0),
            cfg,
            inner: Mutex::new(PoolInner {
                pool: HashMap::new(),
                outpoints: HashMap::new(),
                orphans,
                penny_total: 0.0,
                last_penny_unix: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("mempool lock")
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.lock().pool.contains_key(txid)
    }

    pub fn is_orphan_in_pool(&self, txid: &Hash256) -> bool {
        self.lock().orphans.contains(txid)
    }

    /// Whether the transaction is known, in either the main or orphan
    /// pool.
    pub fn have_transaction(&self, txid: &Hash256) -> bool {
        let inner = self.lock();
        inner.pool.contains_key(txid) || inner.orphans.contains(txid)
    }

    pub fn count(&self) -> usize {
        self.lock().pool.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.lock().orphans.len()
    }

    pub fn tx_hashes(&self) -> Vec<Hash256> {
        self.lock().pool.keys().copied().collect()
    }

    pub fn tx_descs(&self) -> Vec<TxDesc> {
        self.lock().pool.values().cloned().collect()
    }

    pub fn fetch_tx(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        self.lock().pool.get(txid).map(|desc| Arc::clone(&desc.tx))
    }

    pub fn fetch_desc(&self, txid: &Hash256) -> Option<TxDesc> {
        self.lock().pool.get(txid).cloned()
    }

    /// Last time a transaction was added to or removed from the main
    /// pool, as unix seconds.
    pub fn last_updated(&self) -> i64 {
        self.last_updated.load(Ordering::Relaxed)
    }

    /// The pool transaction spending the given outpoint, if any.
    pub fn check_spend(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.lock().outpoints.get(outpoint).copied()
    }

    /// Loads the UTXO entries for the inputs of `tx` from the chain
    /// view, then fills gaps with outputs of pool transactions.
    pub fn fetch_input_utxos(&self, tx: &Transaction) -> Result<UtxoView, MempoolError> {
        let inner = self.lock();
        self.fetch_input_utxos_locked(&inner, tx)
    }

    fn fetch_input_utxos_locked(
        &self,
        inner: &PoolInner,
        tx: &Transaction,
    ) -> Result<UtxoView, MempoolError> {
        let mut view = self.cfg.utxo_cache.fetch_tx_view(tx)?;
        for input in &tx.vin {
            if !view.is_missing_or_spent(&input.prevout) {
                continue;
            }
            if let Some(desc) = inner.pool.get(&input.prevout.hash) {
                view.add_tx_out(&desc.tx, input.prevout.index, UNMINED_HEIGHT);
            }
        }
        Ok(view)
    }

    /// Like `fetch_input_utxos`, additionally overlaying the outputs of
    /// `tx` itself: present if `tx` is pooled, and marked spent where a
    /// pool transaction already consumes them.
    pub fn fetch_utxo_view(&self, tx: &Transaction) -> Result<UtxoView, MempoolError> {
        let inner = self.lock();
        let mut view = self.fetch_input_utxos_locked(&inner, tx)?;

        let txid = tx.txid();
        let exists_in_pool = inner.pool.contains_key(&txid);
        for index in 0..tx.vout.len() as u32 {
            if exists_in_pool {
                view.add_tx_out(tx, index, UNMINED_HEIGHT);
            }
            let outpoint = OutPoint::new(txid, index);
            if inner.outpoints.contains_key(&outpoint) && view.lookup(&outpoint).is_some() {
                view.spend(&outpoint).map_err(MempoolError::Chain)?;
            }
        }
        Ok(view)
    }

    /// Removes a transaction; with `remove_redeemers` set, everything
    /// spending its outputs goes too.
    pub fn remove_transaction(&self, tx: &Transaction, remove_redeemers: bool) {
        let mut inner = self.lock();
        self.remove_transaction_locked(&mut inner, tx, remove_redeemers, now_secs());
    }

    fn remove_transaction_locked(
        &self,
        inner: &mut PoolInner,
        tx: &Transaction,
        remove_redeemers: bool,
        now: u64,
    ) {
        let txid = tx.txid();
        if remove_redeemers {
            for index in 0..tx.vout.len() as u32 {
                let outpoint = OutPoint::new(txid, index);
                let redeemer = inner
                    .outpoints
                    .get(&outpoint)
                    .and_then(|spender| inner.pool.get(spender))
                    .map(|desc| Arc::clone(&desc.tx));
                if let Some(redeemer) = redeemer {
                    self.remove_transaction_locked(inner, &redeemer, true, now);
                }
            }
        }

        if let Some(desc) = inner.pool.remove(&txid) {
            if let Some(addr_index) = &self.cfg.addr_index {
                addr_index.remove_unconfirmed_tx(&txid);
            }
            for input in &desc.tx.vin {
                inner.outpoints.remove(&input.prevout);
            }
            self.last_updated.store(now as i64, Ordering::Relaxed);
        }
    }

    /// Removes every pool transaction that spends an outpoint spent by
    /// `tx`, recursively. Called when a connected block contains
    /// transactions the pool has never seen.
    pub fn remove_double_spends(&self, tx: &Transaction) {
        let mut inner = self.lock();
        self.remove_double_spends_locked(&mut inner, tx, now_secs());
    }

    fn remove_double_spends_locked(&self, inner: &mut PoolInner, tx: &Transaction, now: u64) {
        let txid = tx.txid();
        for input in &tx.vin {
            let conflicting = inner
                .outpoints
                .get(&input.prevout)
                .filter(|spender| **spender != txid)
                .and_then(|spender| inner.pool.get(spender))
                .map(|desc| Arc::clone(&desc.tx));
            if let Some(conflicting) = conflicting {
                self.remove_transaction_locked(inner, &conflicting, true, now);
            }
        }
    }

    /// Drains one transaction of a just-connected block from the pool:
    /// the mined copy leaves (its redeemers stay valid), conflicting
    /// spends are evicted recursively, any orphan copy is dropped, and
    /// orphans the confirmation satisfies are promoted. Returns the
    /// promoted descriptors. Must be called after the UTXO cache has
    /// connected the block.
    pub fn remove_confirmed(&self, tx: &Arc<Transaction>) -> Vec<TxDesc> {
        let now = now_secs();
        let mut inner = self.lock();
        self.remove_transaction_locked(&mut inner, tx, false, now);
        self.remove_double_spends_locked(&mut inner, tx, now);
        inner.orphans.remove(&tx.txid(), false);
        self.process_orphans_locked(&mut inner, tx, now)
    }

    pub fn remove_orphan(&self, txid: &Hash256) {
        self.lock().orphans.remove(txid, false);
    }

    /// Evicts all orphans introduced under the given tag, plus their
    /// descendants.
    pub fn remove_orphans_by_tag(&self, tag: Tag) -> u64 {
        self.lock().orphans.remove_by_tag(tag)
    }

    fn add_transaction_locked(
        &self,
        inner: &mut PoolInner,
        view: &UtxoView,
        tx: &Arc<Transaction>,
        height: i32,
        fee: i64,
        now: u64,
    ) -> TxDesc {
        let txid = tx.txid();
        let size = tx.serialized_size().max(1);
        let desc = TxDesc {
            tx: Arc::clone(tx),
            added: now,
            height,
            fee,
            fee_per_kb: fee.saturating_mul(1000) / size as i64,
            starting_priority: calc_priority(tx, view, height),
        };

        inner.pool.insert(txid, desc.clone());
        for input in &tx.vin {
            inner.outpoints.insert(input.prevout, txid);
        }
        self.last_updated.store(now as i64, Ordering::Relaxed);

        if let Some(addr_index) = &self.cfg.addr_index {
            addr_index.add_unconfirmed_tx(tx, view);
        }
        if let Some(fee_estimator) = &self.cfg.fee_estimator {
            fee_estimator.observe_transaction(&desc);
        }

        desc
    }

    fn check_pool_double_spend(
        &self,
        inner: &PoolInner,
        tx: &Transaction,
    ) -> Result<(), MempoolError> {
        for input in &tx.vin {
            if let Some(spender) = inner.outpoints.get(&input.prevout) {
                return Err(MempoolError::rule(
                    RejectCode::Duplicate,
                    format!(
                        "output {} already spent by transaction {} in the memory pool",
                        input.prevout,
                        hash_to_hex(spender)
                    ),
                ));
            }
        }
        Ok(())
    }

    /// The acceptance pipeline. On success returns either the list of
    /// missing parent hashes (the transaction is an orphan; the caller
    /// decides whether to stash it) or the descriptor it was admitted
    /// under.
    fn maybe_accept_transaction(
        &self,
        inner: &mut PoolInner,
        tx: &Arc<Transaction>,
        is_new: bool,
        rate_limit: bool,
        reject_dup_orphans: bool,
        now: u64,
    ) -> Result<(Vec<Hash256>, Option<TxDesc>), MempoolError> {
        let txid = tx.txid();

        if inner.pool.contains_key(&txid)
            || (reject_dup_orphans && inner.orphans.contains(&txid))
        {
            return Err(MempoolError::rule(
                RejectCode::Duplicate,
                format!("already have transaction {}", hash_to_hex(&txid)),
            ));
        }

        let median_time_past = self.cfg.chain.median_time_past();
        // A standalone transaction will be mined into the next block at
        // best.
        let best_height = self.cfg.chain.best_height();
        let next_block_height = best_height + 1;

        let params = &self.cfg.chain_params;
        let magnetic_anomaly_active = params.magnetic_anomaly_active(next_block_height);
        let upgrade9_active = params.upgrade9_active(next_block_height);
        let upgrade11_active = params.upgrade11_active(median_time_past);

        let mut script_flags = STANDARD_VERIFY_FLAGS;
        if !self.cfg.policy.limit_sig_checks {
            script_flags ^= SCRIPT_VERIFY_INPUT_SIG_CHECKS;
        }
        if upgrade9_active {
            script_flags |= SCRIPT_ALLOW_CASH_TOKENS;
        }
        if upgrade11_active {
            script_flags |= SCRIPT_ALLOW_MAY2025;
            if !self.cfg.policy.accept_non_std {
                script_flags |= SCRIPT_ALLOW_MAY2025_STANDARD_ONLY;
            }
        }

        check_transaction_sanity(tx, magnetic_anomaly_active, upgrade9_active)?;

        // A standalone coinbase is never admitted.
        if tx.is_coinbase() {
            return Err(MempoolError::rule(
                RejectCode::Invalid,
                format!("transaction {} is an individual coinbase", hash_to_hex(&txid)),
            ));
        }

        if !self.cfg.policy.accept_non_std {
            check_transaction_standard(
                tx,
                next_block_height,
                median_time_past,
                &self.cfg.policy,
            )
            .map_err(|err| {
                MempoolError::rule(
                    err.code,
                    format!(
                        "transaction {} is not standard: {}",
                        hash_to_hex(&txid),
                        err.reason
                    ),
                )
            })?;
        }

        // Quick double-spend check against the pool itself; spends of
        // already-spent chain outputs surface below as missing inputs.
        self.check_pool_double_spend(inner, tx)?;

        let mut view = self.fetch_input_utxos_locked(inner, tx)?;

        // If the network already knows this transaction through a mined
        // block with unspent outputs, reject it outright.
        for index in 0..tx.vout.len() as u32 {
            let outpoint = OutPoint::new(txid, index);
            if view.lookup(&outpoint).is_some() {
                return Err(MempoolError::rule(
                    RejectCode::Duplicate,
                    "transaction already exists",
                ));
            }
            view.remove(&outpoint);
        }

        // Any input without a spendable entry makes this an orphan; the
        // caller decides whether to stash it.
        let mut missing_parents: Vec<Hash256> = Vec::new();
        let mut seen_parents: HashSet<Hash256> = HashSet::new();
        for input in &tx.vin {
            if view.is_missing_or_spent(&input.prevout)
                && seen_parents.insert(input.prevout.hash)
            {
                missing_parents.push(input.prevout.hash);
            }
        }
        if !missing_parents.is_empty() {
            return Ok((missing_parents, None));
        }

        // The sequence lock must allow the transaction into the next
        // block.
        let sequence_lock = self.cfg.chain.calc_sequence_lock(tx, &view)?;
        if !sequence_lock_active(&sequence_lock, next_block_height, median_time_past) {
            return Err(MempoolError::rule(
                RejectCode::Nonstandard,
                "transaction's sequence locks on inputs not met",
            ));
        }

        let fee = check_transaction_inputs(tx, next_block_height, &view)?;

        if !self.cfg.policy.accept_non_std {
            check_inputs_standard(tx, &view, &self.cfg.policy).map_err(|err| {
                MempoolError::rule(
                    err.code,
                    format!(
                        "transaction {} has a non-standard input: {}",
                        hash_to_hex(&txid),
                        err.reason
                    ),
                )
            })?;
        }

        // Transactions small enough to ride the block's priority area
        // may pay below the minimum fee; everything else must meet it.
        let serialized_size = tx.serialized_size();
        let min_fee = calc_min_required_relay_fee(serialized_size, self.cfg.policy.min_relay_tx_fee);
        if serialized_size >= DEFAULT_BLOCK_PRIORITY_SIZE - 1000 && fee < min_fee {
            return Err(MempoolError::rule(
                RejectCode::InsufficientFee,
                format!(
                    "transaction {} has {fee} fees which is under the required amount of \
                     {min_fee}",
                    hash_to_hex(&txid)
                ),
            ));
        }

        // Free transactions must carry enough priority, unless they are
        // being re-admitted after a reorg.
        if is_new && !self.cfg.policy.disable_relay_priority && fee < min_fee {
            let current_priority = calc_priority(tx, &view, next_block_height);
            if current_priority <= MIN_HIGH_PRIORITY {
                return Err(MempoolError::rule(
                    RejectCode::InsufficientFee,
                    format!(
                        "transaction {} has insufficient priority ({current_priority:.8} <= \
                         {MIN_HIGH_PRIORITY:.8})",
                        hash_to_hex(&txid)
                    ),
                ));
            }
        }

        // Penny-flooding defense: free transactions drain a decaying
        // byte budget.
        if rate_limit && fee < min_fee {
            let now_unix = now as i64;
            let elapsed = now_unix.saturating_sub(inner.last_penny_unix);
            inner.penny_total *= (1.0f64 - 1.0 / 600.0).powf(elapsed as f64);
            inner.last_penny_unix = now_unix;

            let limit = self.cfg.policy.free_tx_relay_limit * 10.0 * 1000.0;
            if inner.penny_total >= limit {
                return Err(MempoolError::rule(
                    RejectCode::InsufficientFee,
                    format!(
                        "transaction {} has been rejected by the rate limiter due to low fees",
                        hash_to_hex(&txid)
                    ),
                ));
            }
            let old_total = inner.penny_total;
            inner.penny_total += serialized_size as f64;
            log_trace!(
                "rate limit: curTotal {old_total}, nextTotal: {}, limit {limit}",
                inner.penny_total
            );
        }

        self.cfg.script_validator.validate_transaction_scripts(
            tx,
            &view,
            script_flags,
            &self.cfg.sig_cache,
            &self.cfg.hash_cache,
            params.upgrade9_fork_height,
        )?;

        let desc = self.add_transaction_locked(inner, &view, tx, best_height, fee, now);

        log_debug!(
            "Accepted transaction {} (pool size: {})",
            hash_to_hex(&txid),
            inner.pool.len()
        );

        Ok((Vec::new(), Some(desc)))
    }

    /// Public single-transaction acceptance; orphans are reported, not
    /// stashed.
    pub fn maybe_accept(
        &self,
        tx: Arc<Transaction>,
        is_new: bool,
        rate_limit: bool,
    ) -> Result<(Vec<Hash256>, Option<TxDesc>), MempoolError> {
        let mut inner = self.lock();
        self.maybe_accept_transaction(&mut inner, &tx, is_new, rate_limit, true, now_secs())
    }

    /// Moves any orphans made whole by `accepted_tx` into the pool,
    /// breadth-first, until no more descendants can be promoted.
    fn process_orphans_locked(
        &self,
        inner: &mut PoolInner,
        accepted_tx: &Arc<Transaction>,
        now: u64,
    ) -> Vec<TxDesc> {
        let mut accepted: Vec<TxDesc> = Vec::new();
        let mut queue: VecDeque<Arc<Transaction>> = VecDeque::new();
        queue.push_back(Arc::clone(accepted_tx));

        while let Some(parent) = queue.pop_front() {
            let parent_txid = parent.txid();
            for index in 0..parent.vout.len() as u32 {
                let outpoint = OutPoint::new(parent_txid, index);
                // Usually at most one redeemer; multiple mean the orphan
                // pool held double spends and only one can win.
                let redeemers = inner.orphans.redeemers_of(&outpoint);
                for (orphan_txid, orphan_tx) in redeemers {
                    if !inner.orphans.contains(&orphan_txid) {
                        continue;
                    }
                    match self.maybe_accept_transaction(
                        inner, &orphan_tx, true, true, false, now,
                    ) {
                        Err(_) => {
                            // The orphan is invalid now, and so is
                            // anything that depends on it.
                            inner.orphans.remove(&orphan_txid, true);
                            break;
                        }
                        Ok((missing, _)) if !missing.is_empty() => {
                            // Still waiting on other parents; try the
                            // next redeemer of this output.
                            continue;
                        }
                        Ok((_, desc)) => {
                            if let Some(desc) = desc {
                                accepted.push(desc);
                            }
                            inner.orphans.remove(&orphan_txid, false);
                            queue.push_back(orphan_tx);
                            break;
                        }
                    }
                }
            }
        }

        // Orphans conflicting with anything just accepted are definite
        // double spends now.
        inner.orphans.remove_double_spends(accepted_tx);
        for desc in &accepted {
            inner.orphans.remove_double_spends(&desc.tx);
        }

        accepted
    }

    /// Re-examines orphans that depend on `accepted_tx` and promotes
    /// any that are now whole.
    pub fn process_orphans(&self, accepted_tx: &Arc<Transaction>) -> Vec<TxDesc> {
        let mut inner = self.lock();
        self.process_orphans_locked(&mut inner, accepted_tx, now_secs())
    }

    /// The main entry point for a newly received transaction: validate
    /// and admit it, stash it as an orphan when parents are missing (if
    /// allowed), and promote any orphans it satisfies. Returns every
    /// transaction added to the pool, the given one first.
    pub fn process_transaction(
        &self,
        tx: Arc<Transaction>,
        allow_orphan: bool,
        rate_limit: bool,
        tag: Tag,
    ) -> Result<Vec<TxDesc>, MempoolError> {
        log_trace!("Processing transaction {}", hash_to_hex(&tx.txid()));
        let now = now_secs();
        let mut inner = self.lock();

        let (missing_parents, desc) =
            self.maybe_accept_transaction(&mut inner, &tx, true, rate_limit, true, now)?;

        if missing_parents.is_empty() {
            let desc = desc.ok_or_else(|| {
                MempoolError::Chain(cashd_chainstate::ChainStateError::Assertion(
                    "accepted transaction produced no descriptor".to_string(),
                ))
            })?;
            let mut accepted = vec![desc];
            accepted.extend(self.process_orphans_locked(&mut inner, &tx, now));
            return Ok(accepted);
        }

        if !allow_orphan {
            // This matches the duplicate reject code the wire protocol
            // uses for missing inputs; they are usually already-spent
            // outputs.
            return Err(MempoolError::rule(
                RejectCode::Duplicate,
                format!(
                    "orphan transaction {} references outputs of unknown or fully-spent \
                     transaction {}",
                    hash_to_hex(&tx.txid()),
                    hash_to_hex(&missing_parents[0])
                ),
            ));
        }

        inner.orphans.maybe_add(tx, tag, now)?;
        Ok(Vec::new())
    }
}
