//! Capabilities the pool consumes from the surrounding node. The pool
//! treats all of them as opaque; tests substitute simple stand-ins.

use cashd_chainstate::{SequenceLock, UtxoView, ValidationError};
use cashd_consensus::Hash256;
use cashd_primitives::transaction::Transaction;
use cashd_script::{HashCache, ScriptFlags, SigCache};

use crate::pool::TxDesc;

/// Chain-state queries answered by the block manager.
pub trait ChainAdapter: Send + Sync {
    fn best_height(&self) -> i32;

    /// Median of the last eleven block timestamps at the current tip.
    fn median_time_past(&self) -> i64;

    fn calc_sequence_lock(
        &self,
        tx: &Transaction,
        view: &UtxoView,
    ) -> Result<SequenceLock, ValidationError>;

    /// Whether a to-be-soft-forked deployment is active; consulted for
    /// transactions using rules that are not yet in force.
    fn is_deployment_active(&self, deployment_id: u32) -> Result<bool, ValidationError>;
}

/// Full script validation across every input of a transaction. Returns
/// the number of signature checks executed.
pub trait ScriptValidator: Send + Sync {
    fn validate_transaction_scripts(
        &self,
        tx: &Transaction,
        view: &UtxoView,
        flags: ScriptFlags,
        sig_cache: &SigCache,
        hash_cache: &HashCache,
        upgrade9_height: i32,
    ) -> Result<u32, ValidationError>;
}

/// Optional index of unconfirmed transactions by address.
pub trait AddrIndexAdapter: Send + Sync {
    fn add_unconfirmed_tx(&self, tx: &Transaction, view: &UtxoView);
    fn remove_unconfirmed_tx(&self, txid: &Hash256);
}

/// Optional fee estimator fed with every accepted transaction.
pub trait FeeEstimatorAdapter: Send + Sync {
    fn observe_transaction(&self, desc: &TxDesc);
}
