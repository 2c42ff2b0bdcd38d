//! Short-lived UTXO overlays and the block connect/disconnect logic
//! shared between them and the cache.

use std::collections::HashMap;

use cashd_consensus::{Hash256, ZERO_HASH};
use cashd_primitives::block::Block;
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::{Transaction, TxOut};
use cashd_script::standard::is_unspendable;

use crate::undo::StxoRecord;
use crate::utxo::{UtxoEntry, TF_COINBASE, TF_FRESH, TF_MODIFIED};
use crate::ChainStateError;

/// Common surface for structures a transaction or block can be applied
/// to: the plain view and the cache both implement it.
pub trait UtxoOverlay {
    /// Fetches the entry for an outpoint. `None` means the overlay (and
    /// any backing it consults) has no record of the output.
    fn get_entry(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError>;

    /// Adds an entry. With `overwrite` set, freshness and
    /// unspent-collision checks are skipped; used when replaying blocks
    /// whose effects may already be partially present.
    fn add_entry(
        &mut self,
        outpoint: OutPoint,
        entry: UtxoEntry,
        overwrite: bool,
    ) -> Result<(), ChainStateError>;

    /// Marks an entry spent, inserting `if_absent` first when the
    /// overlay has no record of the outpoint.
    fn spend_entry(
        &mut self,
        outpoint: &OutPoint,
        if_absent: Option<UtxoEntry>,
    ) -> Result<(), ChainStateError>;
}

/// A view into the UTXO set from one point of the chain. Explicit `None`
/// values record "looked up, not present" so repeated lookups do not
/// fall through to the backing store.
pub struct UtxoView {
    pub(crate) entries: HashMap<OutPoint, Option<UtxoEntry>>,
    best_hash: Hash256,
}

impl Default for UtxoView {
    fn default() -> Self {
        Self::new()
    }
}

impl UtxoView {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            best_hash: ZERO_HASH,
        }
    }

    pub fn best_hash(&self) -> &Hash256 {
        &self.best_hash
    }

    pub fn set_best_hash(&mut self, hash: Hash256) {
        self.best_hash = hash;
    }

    /// Returns the entry for an outpoint, treating spent entries the
    /// same as absent ones.
    pub fn lookup(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        match self.entries.get(outpoint) {
            Some(Some(entry)) if !entry.is_spent() => Some(entry),
            _ => None,
        }
    }

    /// Number of outpoints the view has an opinion about, including
    /// negative and spent entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.entries.keys()
    }

    /// True when the view recorded a lookup for the outpoint but found
    /// nothing spendable.
    pub fn is_missing_or_spent(&self, outpoint: &OutPoint) -> bool {
        match self.entries.get(outpoint) {
            Some(Some(entry)) => entry.is_spent(),
            Some(None) => true,
            None => true,
        }
    }

    /// Adds an output if it is not provably unspendable. An existing
    /// entry is replaced wholesale: the only legitimate path here is a
    /// duplicate transaction hash recreating an output, which is safe
    /// when the prior entry is fully spent (the caller guarantees it).
    pub fn add_output(
        &mut self,
        outpoint: OutPoint,
        tx_out: &TxOut,
        is_coinbase: bool,
        block_height: i32,
    ) {
        if is_unspendable(&tx_out.script_pubkey) {
            return;
        }
        let mut entry = UtxoEntry::new(tx_out, block_height, is_coinbase);
        entry.flags |= TF_MODIFIED;
        self.entries.insert(outpoint, Some(entry));
    }

    /// Adds output `index` of `tx`. Out-of-range indexes are ignored.
    pub fn add_tx_out(&mut self, tx: &Transaction, index: u32, block_height: i32) {
        let Some(tx_out) = tx.vout.get(index as usize) else {
            return;
        };
        self.add_output(
            OutPoint::new(tx.txid(), index),
            tx_out,
            tx.is_coinbase(),
            block_height,
        );
    }

    /// Marks the entry for an outpoint spent. The outpoint must be
    /// present in the view; spending an unknown outpoint is a bug in the
    /// caller.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<(), ChainStateError> {
        match self.entries.get_mut(outpoint) {
            Some(Some(entry)) => {
                entry.spend();
                Ok(())
            }
            _ => Err(ChainStateError::Assertion(format!(
                "view missing input {outpoint}"
            ))),
        }
    }

    /// Erases the overlay entry for an outpoint.
    pub fn remove(&mut self, outpoint: &OutPoint) {
        self.entries.remove(outpoint);
    }

    /// Deletes entries that are modified and fully spent, and clears
    /// the modified flag on everything else. Called before commit.
    pub fn prune(&mut self) {
        self.entries.retain(|_, entry| match entry {
            None => false,
            Some(entry) => !(entry.is_modified() && entry.is_spent()),
        });
        for entry in self.entries.values_mut().flatten() {
            entry.flags &= !TF_MODIFIED;
        }
    }
}

impl UtxoOverlay for UtxoView {
    fn get_entry(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        Ok(self.entries.get(outpoint).cloned().flatten())
    }

    fn add_entry(
        &mut self,
        outpoint: OutPoint,
        entry: UtxoEntry,
        _overwrite: bool,
    ) -> Result<(), ChainStateError> {
        self.entries.insert(outpoint, Some(entry));
        Ok(())
    }

    fn spend_entry(
        &mut self,
        outpoint: &OutPoint,
        if_absent: Option<UtxoEntry>,
    ) -> Result<(), ChainStateError> {
        let slot = self.entries.entry(*outpoint).or_insert(if_absent);
        if let Some(entry) = slot {
            entry.spend();
        }
        Ok(())
    }
}

/// Adds the outputs of `tx` to the overlay. Entries created outside of
/// recovery replay are marked fresh so a spend before the next flush can
/// simply drop them.
pub fn add_tx_outputs(
    view: &mut impl UtxoOverlay,
    tx: &Transaction,
    block_height: i32,
    overwrite: bool,
) -> Result<(), ChainStateError> {
    let is_coinbase = tx.is_coinbase();
    let txid = tx.txid();
    for (index, tx_out) in tx.vout.iter().enumerate() {
        if is_unspendable(&tx_out.script_pubkey) {
            continue;
        }
        let mut entry = UtxoEntry::new(tx_out, block_height, is_coinbase);
        entry.flags |= TF_MODIFIED;
        if !overwrite {
            entry.flags |= TF_FRESH;
        }
        view.add_entry(OutPoint::new(txid, index as u32), entry, overwrite)?;
    }
    Ok(())
}

/// Spends every input of `tx` in the overlay, appending each consumed
/// entry's pre-image to `stxos` in input order when requested.
pub fn spend_tx_inputs(
    view: &mut impl UtxoOverlay,
    tx: &Transaction,
    mut stxos: Option<&mut Vec<StxoRecord>>,
) -> Result<(), ChainStateError> {
    for input in &tx.vin {
        let entry = view.get_entry(&input.prevout)?.ok_or_else(|| {
            ChainStateError::Assertion(format!("view missing input {}", input.prevout))
        })?;

        if let Some(stxos) = stxos.as_deref_mut() {
            stxos.push(StxoRecord {
                amount: entry.amount(),
                script: entry.script().to_vec(),
                token_data: entry.token_data().cloned(),
                height: entry.block_height(),
                is_coinbase: entry.is_coinbase(),
            });
        }

        view.spend_entry(&input.prevout, Some(entry))?;
    }
    Ok(())
}

/// Applies a whole block to the overlay: all outputs first, then all
/// inputs. The separation tolerates intra-block orderings where a child
/// spends a parent that appears later in the same block.
pub fn connect_block_transactions(
    view: &mut impl UtxoOverlay,
    block: &Block,
    block_height: i32,
    mut stxos: Option<&mut Vec<StxoRecord>>,
    overwrite: bool,
) -> Result<(), ChainStateError> {
    for tx in &block.transactions {
        add_tx_outputs(view, tx, block_height, overwrite)?;
    }
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            spend_tx_inputs(view, tx, stxos.as_deref_mut())?;
        }
    }
    Ok(())
}

pub fn count_spent_outputs(block: &Block) -> usize {
    block
        .transactions
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .map(|tx| tx.vin.len())
        .sum()
}

/// Reverses a block: restores every spent input from the journal in
/// reverse order, then marks every output the block created as spent.
/// In a pruned set there is no difference between an output that no
/// longer exists and one that was spent.
pub fn disconnect_block_transactions(
    view: &mut impl UtxoOverlay,
    block: &Block,
    block_height: i32,
    stxos: &[StxoRecord],
) -> Result<(), ChainStateError> {
    if stxos.len() != count_spent_outputs(block) {
        return Err(ChainStateError::Assertion(
            "disconnect called with bad spent transaction out information".to_string(),
        ));
    }

    let mut stxo_idx = stxos.len();
    for tx in block.transactions.iter().rev() {
        if tx.is_coinbase() {
            continue;
        }
        for input in tx.vin.iter().rev() {
            stxo_idx -= 1;
            let stxo = &stxos[stxo_idx];

            let mut flags = TF_MODIFIED;
            if stxo.is_coinbase {
                flags |= TF_COINBASE;
            }
            let entry = UtxoEntry {
                amount: stxo.amount,
                script: stxo.script.clone(),
                token_data: stxo.token_data.clone(),
                block_height: stxo.height,
                flags,
            };
            view.add_entry(input.prevout, entry, true)?;
        }
    }

    for tx in block.transactions.iter().rev() {
        let is_coinbase = tx.is_coinbase();
        let txid = tx.txid();
        for (index, tx_out) in tx.vout.iter().enumerate() {
            if is_unspendable(&tx_out.script_pubkey) {
                continue;
            }
            // To make sure the overlay has an entry to mark, pass one
            // along for the absent case.
            let entry = UtxoEntry::new(tx_out, block_height, is_coinbase);
            view.spend_entry(&OutPoint::new(txid, index as u32), Some(entry))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashd_primitives::transaction::{TxIn, TxOut};

    fn p2pkh(tag: u8) -> Vec<u8> {
        let mut script = Vec::with_capacity(25);
        script.extend_from_slice(&[0x76, 0xa9, 0x14]);
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    #[test]
    fn add_output_drops_unspendable() {
        let mut view = UtxoView::new();
        let outpoint = OutPoint::new([1u8; 32], 0);
        view.add_output(outpoint, &TxOut::new(1_000, vec![0x6a]), false, 10);
        assert!(view.lookup(&outpoint).is_none());
        assert!(view.is_empty());
    }

    #[test]
    fn lookup_hides_spent_entries() {
        let mut view = UtxoView::new();
        let outpoint = OutPoint::new([1u8; 32], 0);
        view.add_output(outpoint, &TxOut::new(1_000, p2pkh(1)), false, 10);
        assert!(view.lookup(&outpoint).is_some());

        view.spend(&outpoint).expect("spend");
        assert!(view.lookup(&outpoint).is_none());
        assert!(view.is_missing_or_spent(&outpoint));
    }

    #[test]
    fn spend_unknown_outpoint_is_an_assertion() {
        let mut view = UtxoView::new();
        let err = view.spend(&OutPoint::new([1u8; 32], 0)).unwrap_err();
        assert!(matches!(err, ChainStateError::Assertion(_)));
    }

    #[test]
    fn prune_drops_modified_spent_and_clears_modified() {
        let mut view = UtxoView::new();
        let spent = OutPoint::new([1u8; 32], 0);
        let kept = OutPoint::new([1u8; 32], 1);
        view.add_output(spent, &TxOut::new(1_000, p2pkh(1)), false, 10);
        view.add_output(kept, &TxOut::new(2_000, p2pkh(2)), false, 10);
        view.spend(&spent).expect("spend");

        view.prune();

        assert!(view.entries.get(&spent).is_none());
        let entry = view.entries.get(&kept).and_then(|e| e.as_ref()).unwrap();
        assert!(!entry.is_modified());
    }

    #[test]
    fn connect_tolerates_child_before_parent() {
        // Child appears before its in-block parent; outputs are applied
        // before any inputs so the spend still resolves.
        let parent = Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(5_000, p2pkh(1))],
            lock_time: 0,
        };
        let child = Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: OutPoint::new(parent.txid(), 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(4_000, p2pkh(2))],
            lock_time: 0,
        };

        let block = Block {
            header: cashd_primitives::block::BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![child.clone(), parent.clone()],
        };

        let mut view = UtxoView::new();
        let mut stxos = Vec::new();
        connect_block_transactions(&mut view, &block, 10, Some(&mut stxos), false)
            .expect("connect");

        assert_eq!(stxos.len(), 1);
        assert_eq!(stxos[0].amount, 5_000);
        assert!(view.lookup(&OutPoint::new(parent.txid(), 0)).is_none());
        assert!(view.lookup(&OutPoint::new(child.txid(), 0)).is_some());
    }

    #[test]
    fn connect_then_disconnect_restores_view() {
        let funding = OutPoint::new([9u8; 32], 0);
        let spender = Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: funding,
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(900, p2pkh(3))],
            lock_time: 0,
        };
        let coinbase = Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(50_000, p2pkh(4))],
            lock_time: 0,
        };
        let block = Block {
            header: cashd_primitives::block::BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![coinbase.clone(), spender.clone()],
        };

        let mut view = UtxoView::new();
        view.add_output(funding, &TxOut::new(1_000, p2pkh(9)), false, 5);

        let mut stxos = Vec::new();
        connect_block_transactions(&mut view, &block, 10, Some(&mut stxos), false)
            .expect("connect");
        assert!(view.lookup(&funding).is_none());

        disconnect_block_transactions(&mut view, &block, 10, &stxos).expect("disconnect");
        let restored = view.lookup(&funding).expect("restored");
        assert_eq!(restored.amount(), 1_000);
        assert_eq!(restored.block_height(), 5);
        assert!(view.lookup(&OutPoint::new(spender.txid(), 0)).is_none());
        assert!(view.lookup(&OutPoint::new(coinbase.txid(), 0)).is_none());
    }

    #[test]
    fn disconnect_rejects_bad_stxo_count() {
        let block = Block {
            header: cashd_primitives::block::BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![Transaction {
                version: 2,
                vin: vec![TxIn {
                    prevout: OutPoint::new([1u8; 32], 0),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                }],
                vout: vec![TxOut::new(1, p2pkh(1))],
                lock_time: 0,
            }],
        };
        let mut view = UtxoView::new();
        let err = disconnect_block_transactions(&mut view, &block, 1, &[]).unwrap_err();
        assert!(matches!(err, ChainStateError::Assertion(_)));
    }
}
