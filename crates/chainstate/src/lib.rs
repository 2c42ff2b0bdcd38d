//! UTXO set state: entries, views, the write-back cache, the spend
//! journal, and the consensus-level transaction checks that consult
//! them.

pub mod cache;
pub mod undo;
pub mod utxo;
pub mod validation;
pub mod view;

use std::fmt;

use cashd_primitives::encoding::DecodeError;
use cashd_storage::StoreError;

pub use cache::{
    BestState, BlockNode, BlockSource, CacheConfig, ConsistencyStatus, FlushMode, UtxoCache,
};
pub use undo::StxoRecord;
pub use utxo::{UtxoEntry, UNMINED_HEIGHT};
pub use validation::{
    check_transaction_inputs, check_transaction_sanity, sequence_lock_active, SequenceLock,
    ValidationError,
};
pub use view::{UtxoOverlay, UtxoView};

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Decode(DecodeError),
    /// An internal invariant was violated. Indicates a bug; the
    /// operation is aborted rather than corrupting state.
    Assertion(String),
    /// Recovery observed the cooperative cancellation signal.
    Interrupted,
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Assertion(message) => write!(f, "assertion failed: {message}"),
            ChainStateError::Interrupted => write!(f, "operation interrupted"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}
