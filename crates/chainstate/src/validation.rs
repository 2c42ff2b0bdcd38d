//! Consensus-level transaction checks consulted during acceptance.
//!
//! These are the invariant rules for what may enter a block; the
//! mempool layers its relay policy on top.

use std::collections::HashSet;
use std::fmt;

use cashd_consensus::constants::{
    COINBASE_MATURITY, MAX_COINBASE_SCRIPT_LEN, MAX_TX_SIZE, MIN_TX_SIZE,
};
use cashd_consensus::money::{money_range, MAX_MONEY};
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::Transaction;

use crate::view::UtxoView;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    NoTxInputs,
    NoTxOutputs,
    TxTooSmall(usize),
    TxTooLarge(usize),
    BadTxOutValue(i64),
    OutputTotalTooHigh,
    DuplicateTxInputs(OutPoint),
    BadTxInput,
    BadCoinbaseScriptLen(usize),
    TokenPayloadNotActive,
    InvalidTokenPayload,
    MissingInput(OutPoint),
    ImmatureCoinbaseSpend {
        origin_height: i32,
        spend_height: i32,
    },
    InputValueOutOfRange,
    SpendTooHigh {
        value_in: i64,
        value_out: i64,
    },
    /// Failure reported by the script validator.
    Script(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NoTxInputs => write!(f, "transaction has no inputs"),
            ValidationError::NoTxOutputs => write!(f, "transaction has no outputs"),
            ValidationError::TxTooSmall(size) => {
                write!(f, "serialized transaction is too small: {size} bytes")
            }
            ValidationError::TxTooLarge(size) => {
                write!(f, "serialized transaction is too big: {size} bytes")
            }
            ValidationError::BadTxOutValue(value) => {
                write!(f, "transaction output value of {value} is out of range")
            }
            ValidationError::OutputTotalTooHigh => {
                write!(f, "total value of all transaction outputs exceeds the maximum")
            }
            ValidationError::DuplicateTxInputs(outpoint) => {
                write!(f, "transaction contains duplicate input {outpoint}")
            }
            ValidationError::BadTxInput => {
                write!(f, "transaction input refers to a null previous outpoint")
            }
            ValidationError::BadCoinbaseScriptLen(len) => {
                write!(f, "coinbase signature script length of {len} is out of range")
            }
            ValidationError::TokenPayloadNotActive => {
                write!(f, "token payload before token activation")
            }
            ValidationError::InvalidTokenPayload => write!(f, "invalid token payload"),
            ValidationError::MissingInput(outpoint) => {
                write!(f, "referenced output {outpoint} is missing or already spent")
            }
            ValidationError::ImmatureCoinbaseSpend {
                origin_height,
                spend_height,
            } => write!(
                f,
                "coinbase output created at height {origin_height} spent prematurely at \
                 height {spend_height}"
            ),
            ValidationError::InputValueOutOfRange => {
                write!(f, "total value of all transaction inputs is out of range")
            }
            ValidationError::SpendTooHigh {
                value_in,
                value_out,
            } => write!(
                f,
                "total value of inputs {value_in} is below total value of outputs {value_out}"
            ),
            ValidationError::Script(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Context-free sanity checks on a single transaction.
pub fn check_transaction_sanity(
    tx: &Transaction,
    magnetic_anomaly_active: bool,
    upgrade9_active: bool,
) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::NoTxInputs);
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::NoTxOutputs);
    }

    let size = tx.serialized_size();
    if size > MAX_TX_SIZE {
        return Err(ValidationError::TxTooLarge(size));
    }
    if magnetic_anomaly_active && size < MIN_TX_SIZE {
        return Err(ValidationError::TxTooSmall(size));
    }

    let mut total_out: i64 = 0;
    for output in &tx.vout {
        if output.value < 0 || output.value > MAX_MONEY {
            return Err(ValidationError::BadTxOutValue(output.value));
        }
        total_out = total_out
            .checked_add(output.value)
            .ok_or(ValidationError::OutputTotalTooHigh)?;
        if !money_range(total_out) {
            return Err(ValidationError::OutputTotalTooHigh);
        }

        if let Some(token) = &output.token_data {
            if !upgrade9_active {
                return Err(ValidationError::TokenPayloadNotActive);
            }
            if !token.is_valid_bitfield() {
                return Err(ValidationError::InvalidTokenPayload);
            }
        }
    }

    let mut seen: HashSet<OutPoint> = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::DuplicateTxInputs(input.prevout));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=MAX_COINBASE_SCRIPT_LEN).contains(&script_len) {
            return Err(ValidationError::BadCoinbaseScriptLen(script_len));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(ValidationError::BadTxInput);
            }
        }
    }

    Ok(())
}

/// Validates the inputs of `tx` against the view and returns the fee.
/// The view must hold an unspent entry for every input.
pub fn check_transaction_inputs(
    tx: &Transaction,
    next_height: i32,
    view: &UtxoView,
) -> Result<i64, ValidationError> {
    if tx.is_coinbase() {
        return Ok(0);
    }

    let mut value_in: i64 = 0;
    for input in &tx.vin {
        let entry = view
            .lookup(&input.prevout)
            .ok_or(ValidationError::MissingInput(input.prevout))?;

        if entry.is_coinbase() {
            let blocks_since = next_height.saturating_sub(entry.block_height());
            if blocks_since < COINBASE_MATURITY {
                return Err(ValidationError::ImmatureCoinbaseSpend {
                    origin_height: entry.block_height(),
                    spend_height: next_height,
                });
            }
        }

        let amount = entry.amount();
        if !money_range(amount) {
            return Err(ValidationError::InputValueOutOfRange);
        }
        value_in = value_in
            .checked_add(amount)
            .ok_or(ValidationError::InputValueOutOfRange)?;
        if !money_range(value_in) {
            return Err(ValidationError::InputValueOutOfRange);
        }
    }

    let mut value_out: i64 = 0;
    for output in &tx.vout {
        value_out = value_out
            .checked_add(output.value)
            .ok_or(ValidationError::OutputTotalTooHigh)?;
    }

    if value_in < value_out {
        return Err(ValidationError::SpendTooHigh {
            value_in,
            value_out,
        });
    }

    Ok(value_in - value_out)
}

/// Relative lock computed from a transaction's sequence numbers. The
/// defaults of -1 are satisfied everywhere.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequenceLock {
    pub seconds: i64,
    pub block_height: i32,
}

impl SequenceLock {
    pub fn unrestricted() -> Self {
        Self {
            seconds: -1,
            block_height: -1,
        }
    }
}

/// A sequence lock is satisfied once both of its components are in the
/// past relative to the confirming block.
pub fn sequence_lock_active(
    lock: &SequenceLock,
    block_height: i32,
    median_time_past: i64,
) -> bool {
    lock.seconds < median_time_past && lock.block_height < block_height
}
