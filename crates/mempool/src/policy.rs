//! Relay policy: the stricter-than-consensus rules applied before a
//! transaction is admitted to the pool.

use cashd_consensus::constants::{LOCK_TIME_THRESHOLD, SEQUENCE_FINAL};
use cashd_consensus::money::{COIN, MAX_MONEY};
use cashd_primitives::transaction::{Transaction, TxOut};
use cashd_script::standard::{
    classify_script_pubkey, count_sigops, is_push_only, is_standard_op_return,
    parse_push_only_stack, ScriptType, OP_RETURN,
};
use cashd_chainstate::{UtxoView, UNMINED_HEIGHT};

use crate::error::{RejectCode, TxRuleError};

/// Reserved block area for high-priority / low-fee transactions;
/// transactions under this size (less a safety margin) may relay free.
pub const DEFAULT_BLOCK_PRIORITY_SIZE: usize = 1_600_000;

pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
pub const MAX_STANDARD_SIG_SCRIPT_SIZE: usize = 1_650;
pub const MAX_STANDARD_P2SH_SIG_OPS: u32 = 15;
pub const MAX_DATA_CARRIER_SIZE: usize = 223;

pub const DEFAULT_MIN_RELAY_TX_FEE: i64 = 1_000;
pub const DEFAULT_MAX_ORPHAN_TXS: usize = 100;
pub const DEFAULT_MAX_ORPHAN_TX_SIZE: usize = 100_000;

/// Priority above which a free transaction is considered high priority:
/// one coin-day of age per 250 bytes.
pub const MIN_HIGH_PRIORITY: f64 = (COIN as f64) * 144.0 / 250.0;

#[derive(Clone, Debug)]
pub struct Policy {
    /// Transactions above this version are rejected as non-standard.
    pub max_tx_version: i32,
    /// Skip the priority gate for low-fee transactions.
    pub disable_relay_priority: bool,
    /// Accept non-standard transactions into the pool.
    pub accept_non_std: bool,
    /// Free-transaction budget, in thousands of bytes per minute.
    pub free_tx_relay_limit: f64,
    pub max_orphan_txs: usize,
    pub max_orphan_tx_size: usize,
    /// Apply the standardness cap on per-input signature checks.
    pub limit_sig_checks: bool,
    /// Minimum relay fee, satoshis per 1000 bytes.
    pub min_relay_tx_fee: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_tx_version: 2,
            disable_relay_priority: false,
            accept_non_std: false,
            free_tx_relay_limit: 15.0,
            max_orphan_txs: DEFAULT_MAX_ORPHAN_TXS,
            max_orphan_tx_size: DEFAULT_MAX_ORPHAN_TX_SIZE,
            limit_sig_checks: true,
            min_relay_tx_fee: DEFAULT_MIN_RELAY_TX_FEE,
        }
    }
}

/// Minimum fee in satoshis a transaction of the given size must pay to
/// relay. Rates that round to zero charge the per-kB rate instead.
pub fn calc_min_required_relay_fee(serialized_size: usize, min_relay_fee_per_kb: i64) -> i64 {
    if min_relay_fee_per_kb <= 0 {
        return 0;
    }
    let size = i64::try_from(serialized_size).unwrap_or(i64::MAX);
    let mut fee = min_relay_fee_per_kb
        .saturating_mul(size)
        .saturating_div(1000);
    if fee == 0 {
        fee = min_relay_fee_per_kb;
    }
    fee.clamp(0, MAX_MONEY)
}

/// An output is dust when spending it would cost more than a third of
/// its value at the minimum relay fee.
pub fn is_dust(output: &TxOut, min_relay_fee_per_kb: i64) -> bool {
    if min_relay_fee_per_kb <= 0 {
        return false;
    }
    if output.script_pubkey.first().copied() == Some(OP_RETURN) {
        return false;
    }
    if output.value < 0 {
        return true;
    }
    let out_size = 8usize
        .saturating_add(compact_size_len(output.script_pubkey.len()))
        .saturating_add(output.script_pubkey.len());
    // 148 bytes covers the input that will eventually spend it.
    let spend_size = out_size.saturating_add(148);
    let fee = calc_min_required_relay_fee(spend_size, min_relay_fee_per_kb);
    output.value < fee.saturating_mul(3)
}

fn compact_size_len(value: usize) -> usize {
    if value < 0xfd {
        1
    } else if value <= 0xffff {
        3
    } else if value <= 0xffff_ffff {
        5
    } else {
        9
    }
}

/// Whether the transaction's lock time is satisfied at the given block
/// height and time.
pub fn is_finalized_transaction(tx: &Transaction, block_height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCK_TIME_THRESHOLD {
        i64::from(block_height)
    } else {
        block_time
    };
    if i64::from(tx.lock_time) < cutoff {
        return true;
    }
    // A transaction with a future lock time is still final if every
    // input opted out of lock-time semantics.
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// The standardness gate: version range, finality, size ceiling,
/// per-input script form, per-output script form, and dust thresholds.
pub fn check_transaction_standard(
    tx: &Transaction,
    next_block_height: i32,
    median_time_past: i64,
    policy: &Policy,
) -> Result<(), TxRuleError> {
    if tx.version > policy.max_tx_version || tx.version < 1 {
        return Err(TxRuleError::new(
            RejectCode::Nonstandard,
            format!(
                "transaction version {} is not in the valid range of 1-{}",
                tx.version, policy.max_tx_version
            ),
        ));
    }

    if !is_finalized_transaction(tx, next_block_height, median_time_past) {
        return Err(TxRuleError::new(
            RejectCode::Nonstandard,
            "transaction is not finalized",
        ));
    }

    let size = tx.serialized_size();
    if size > MAX_STANDARD_TX_SIZE {
        return Err(TxRuleError::new(
            RejectCode::Nonstandard,
            format!(
                "transaction size of {size} is larger than max allowed size of \
                 {MAX_STANDARD_TX_SIZE}"
            ),
        ));
    }

    for (index, input) in tx.vin.iter().enumerate() {
        if input.script_sig.len() > MAX_STANDARD_SIG_SCRIPT_SIZE {
            return Err(TxRuleError::new(
                RejectCode::Nonstandard,
                format!(
                    "transaction input {index}: signature script size of {} bytes is \
                     larger than the maximum of {MAX_STANDARD_SIG_SCRIPT_SIZE}",
                    input.script_sig.len()
                ),
            ));
        }
        if !is_push_only(&input.script_sig) {
            return Err(TxRuleError::new(
                RejectCode::Nonstandard,
                format!("transaction input {index}: signature script is not push only"),
            ));
        }
    }

    let mut null_data_outputs = 0usize;
    for (index, output) in tx.vout.iter().enumerate() {
        if output.script_pubkey.first().copied() == Some(OP_RETURN) {
            if !is_standard_op_return(&output.script_pubkey, MAX_DATA_CARRIER_SIZE) {
                return Err(TxRuleError::new(
                    RejectCode::Nonstandard,
                    format!("transaction output {index}: non-standard data carrier"),
                ));
            }
            null_data_outputs += 1;
            continue;
        }

        match classify_script_pubkey(&output.script_pubkey) {
            ScriptType::P2Pk | ScriptType::P2Pkh | ScriptType::P2Sh => {}
            ScriptType::NullData | ScriptType::Unknown => {
                return Err(TxRuleError::new(
                    RejectCode::Nonstandard,
                    format!("transaction output {index}: non-standard script form"),
                ));
            }
        }

        if is_dust(output, policy.min_relay_tx_fee) {
            return Err(TxRuleError::new(
                RejectCode::Nonstandard,
                format!(
                    "transaction output {index}: payment of {} is dust",
                    output.value
                ),
            ));
        }
    }

    if null_data_outputs > 1 {
        return Err(TxRuleError::new(
            RejectCode::Nonstandard,
            "more than one transaction output in a nulldata script",
        ));
    }

    Ok(())
}

/// Standardness checks that need the referenced output scripts: P2SH
/// redeem scripts may not carry an excessive number of signature
/// operations.
pub fn check_inputs_standard(
    tx: &Transaction,
    view: &UtxoView,
    _policy: &Policy,
) -> Result<(), TxRuleError> {
    for (index, input) in tx.vin.iter().enumerate() {
        let Some(entry) = view.lookup(&input.prevout) else {
            continue;
        };
        if classify_script_pubkey(entry.script()) != ScriptType::P2Sh {
            continue;
        }

        let stack = parse_push_only_stack(&input.script_sig).ok_or_else(|| {
            TxRuleError::new(
                RejectCode::Nonstandard,
                format!("transaction input {index}: signature script is not push only"),
            )
        })?;
        let redeem = stack.last().filter(|item| !item.is_empty()).ok_or_else(|| {
            TxRuleError::new(
                RejectCode::Nonstandard,
                format!("transaction input {index}: missing redeem script"),
            )
        })?;
        let sig_ops = count_sigops(redeem, true).ok_or_else(|| {
            TxRuleError::new(
                RejectCode::Nonstandard,
                format!("transaction input {index}: malformed redeem script"),
            )
        })?;
        if sig_ops > MAX_STANDARD_P2SH_SIG_OPS {
            return Err(TxRuleError::new(
                RejectCode::Nonstandard,
                format!(
                    "transaction input {index} has {sig_ops} signature operations which is \
                     more than the allowed max amount of {MAX_STANDARD_P2SH_SIG_OPS}"
                ),
            ));
        }
    }
    Ok(())
}

/// Modified size discounts part of each signature script, so signing a
/// transaction does not lower its priority.
pub fn calc_modified_size(tx: &Transaction, serialized_size: usize) -> usize {
    let mut size = serialized_size;
    for input in &tx.vin {
        let offset = 41usize.saturating_add(110usize.min(input.script_sig.len()));
        if size > offset {
            size -= offset;
        }
    }
    size
}

/// Age-weighted input value per byte. Pool-resident inputs contribute
/// no age.
pub fn calc_priority(tx: &Transaction, view: &UtxoView, next_block_height: i32) -> f64 {
    let serialized_size = tx.serialized_size();
    let modified_size = calc_modified_size(tx, serialized_size);
    if modified_size == 0 {
        return 0.0;
    }

    let mut total_input_age = 0.0f64;
    for input in &tx.vin {
        let Some(entry) = view.lookup(&input.prevout) else {
            continue;
        };
        let origin_height = entry.block_height();
        if origin_height == UNMINED_HEIGHT {
            continue;
        }
        let age = i64::from(next_block_height.saturating_sub(origin_height)).max(0);
        total_input_age += (entry.amount().max(0) as f64) * age as f64;
    }

    total_input_age / modified_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashd_primitives::outpoint::OutPoint;
    use cashd_primitives::transaction::TxIn;

    fn p2pkh(tag: u8) -> Vec<u8> {
        let mut script = Vec::with_capacity(25);
        script.extend_from_slice(&[0x76, 0xa9, 0x14]);
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn standard_tx() -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: vec![0x02, 0xaa, 0xbb],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut::new(100_000, p2pkh(1))],
            lock_time: 0,
        }
    }

    #[test]
    fn min_relay_fee_scales_and_floors() {
        assert_eq!(calc_min_required_relay_fee(1000, 1_000), 1_000);
        assert_eq!(calc_min_required_relay_fee(250, 1_000), 250);
        // A rate small enough to round to zero charges the rate itself.
        assert_eq!(calc_min_required_relay_fee(100, 3), 3);
        assert_eq!(calc_min_required_relay_fee(1000, 0), 0);
    }

    #[test]
    fn dust_threshold() {
        // 25-byte P2PKH: 34 output bytes + 148 spend bytes = 182; at
        // 1000 sat/kB the spend fee is 182, dust cutoff 546.
        let output = TxOut::new(545, p2pkh(1));
        assert!(is_dust(&output, 1_000));
        let output = TxOut::new(546, p2pkh(1));
        assert!(!is_dust(&output, 1_000));

        // Data carriers are never dust, free relay fee means no dust.
        let output = TxOut::new(0, vec![OP_RETURN]);
        assert!(!is_dust(&output, 1_000));
        let output = TxOut::new(1, p2pkh(1));
        assert!(!is_dust(&output, 0));
    }

    #[test]
    fn finality() {
        let mut tx = standard_tx();
        assert!(is_finalized_transaction(&tx, 100, 0));

        // Height-based lock in the future, inputs still replaceable.
        tx.lock_time = 200;
        tx.vin[0].sequence = 0;
        assert!(!is_finalized_transaction(&tx, 100, 0));
        assert!(is_finalized_transaction(&tx, 201, 0));

        // All-final sequences override the lock time.
        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(is_finalized_transaction(&tx, 100, 0));

        // Time-based lock compares against the block time.
        tx.lock_time = LOCK_TIME_THRESHOLD + 100;
        tx.vin[0].sequence = 0;
        assert!(!is_finalized_transaction(
            &tx,
            100,
            i64::from(LOCK_TIME_THRESHOLD)
        ));
        assert!(is_finalized_transaction(
            &tx,
            100,
            i64::from(LOCK_TIME_THRESHOLD) + 101
        ));
    }

    #[test]
    fn standardness_version_and_scripts() {
        let policy = Policy::default();

        let mut tx = standard_tx();
        assert!(check_transaction_standard(&tx, 100, 0, &policy).is_ok());

        tx.version = 3;
        assert!(check_transaction_standard(&tx, 100, 0, &policy).is_err());
        tx.version = 0;
        assert!(check_transaction_standard(&tx, 100, 0, &policy).is_err());

        let mut tx = standard_tx();
        tx.vin[0].script_sig = vec![0x76];
        let err = check_transaction_standard(&tx, 100, 0, &policy).unwrap_err();
        assert_eq!(err.code, RejectCode::Nonstandard);

        let mut tx = standard_tx();
        tx.vout[0].script_pubkey = vec![0x51, 0x51];
        assert!(check_transaction_standard(&tx, 100, 0, &policy).is_err());
    }

    #[test]
    fn standardness_null_data_limits() {
        let policy = Policy::default();

        let mut tx = standard_tx();
        tx.vout.push(TxOut::new(0, vec![OP_RETURN, 0x02, 0x01, 0x02]));
        assert!(check_transaction_standard(&tx, 100, 0, &policy).is_ok());

        tx.vout.push(TxOut::new(0, vec![OP_RETURN]));
        let err = check_transaction_standard(&tx, 100, 0, &policy).unwrap_err();
        assert!(err.reason.contains("nulldata"));
    }

    #[test]
    fn p2sh_redeem_sigops_capped() {
        let policy = Policy::default();

        let mut p2sh = vec![0xa9, 0x14];
        p2sh.extend_from_slice(&[2u8; 20]);
        p2sh.push(0x87);

        let funding = OutPoint::new([5u8; 32], 0);
        let mut view = UtxoView::new();
        view.add_output(funding, &TxOut::new(10_000, p2sh), false, 10);

        // Redeem script with 16 CHECKSIGs, pushed as the last item.
        let redeem: Vec<u8> = vec![0xac; 16];
        let mut script_sig = vec![redeem.len() as u8];
        script_sig.extend_from_slice(&redeem);

        let tx = Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: funding,
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut::new(9_000, p2pkh(1))],
            lock_time: 0,
        };

        let err = check_inputs_standard(&tx, &view, &policy).unwrap_err();
        assert!(err.reason.contains("signature operations"));
    }

    #[test]
    fn priority_weights_value_by_age() {
        let funding = OutPoint::new([6u8; 32], 0);
        let mut view = UtxoView::new();
        view.add_output(funding, &TxOut::new(100_000_000, p2pkh(1)), false, 100);

        let tx = standard_tx();
        let mut tx = tx;
        tx.vin[0].prevout = funding;

        let low = calc_priority(&tx, &view, 101);
        let high = calc_priority(&tx, &view, 245);
        assert!(high > low);
        assert!(low > 0.0);

        // Pool-resident inputs add no age.
        let mut pool_view = UtxoView::new();
        pool_view.add_output(
            funding,
            &TxOut::new(100_000_000, p2pkh(1)),
            false,
            UNMINED_HEIGHT,
        );
        assert_eq!(calc_priority(&tx, &pool_view, 101), 0.0);
    }
}
