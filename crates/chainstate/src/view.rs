//! Per-block overlay of unspent outputs.

use std::collections::HashMap;

use hybridd_consensus::money::Amount;
use hybridd_consensus::Hash256;
use hybridd_primitives::outpoint::OutPoint;
use hybridd_primitives::transaction::{Transaction, TxOut};

use crate::coins::RewindData;
use crate::errors::{ConsensusError, ErrorCode};
use crate::utxo::UnspentOutputs;

#[derive(Clone, Debug)]
struct ViewEntry {
    current: Option<UnspentOutputs>,
    original: Option<UnspentOutputs>,
    touched: bool,
}

/// Records loaded for one block, mutated as its transactions execute. Spent
/// outputs are marked in place; records are never dropped mid-block.
#[derive(Clone, Debug, Default)]
pub struct UnspentOutputSet {
    entries: HashMap<Hash256, ViewEntry>,
}

impl UnspentOutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the view with fetched records; `None` marks an id the store
    /// does not know.
    pub fn set_coins(&mut self, records: impl IntoIterator<Item = (Hash256, Option<UnspentOutputs>)>) {
        for (txid, record) in records {
            self.entries.entry(txid).or_insert(ViewEntry {
                current: record.clone(),
                original: record,
                touched: false,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn access_coins(&self, txid: &Hash256) -> Option<&UnspentOutputs> {
        self.entries
            .get(txid)
            .and_then(|entry| entry.current.as_ref())
    }

    pub fn spent_output(&self, prevout: &OutPoint) -> Option<&TxOut> {
        self.access_coins(&prevout.hash)
            .and_then(|coins| coins.output(prevout.index))
    }

    /// True iff every input refers to an output that is present and unspent.
    pub fn have_inputs(&self, tx: &Transaction) -> bool {
        if tx.is_coinbase() {
            return true;
        }
        tx.vin
            .iter()
            .all(|input| self.spent_output(&input.prevout).is_some())
    }

    /// Sum of the values `tx` spends; `None` if an input is missing or the sum
    /// overflows.
    pub fn value_in(&self, tx: &Transaction) -> Option<Amount> {
        if tx.is_coinbase() {
            return Some(0);
        }
        tx.vin.iter().try_fold(0i64, |acc, input| {
            let output = self.spent_output(&input.prevout)?;
            acc.checked_add(output.value)
        })
    }

    /// Spends the inputs of `tx` and adds its outputs at `height`.
    /// `coinstake` marks the new record for coinstake maturity.
    pub fn update(
        &mut self,
        tx: &Transaction,
        txid: Hash256,
        height: u32,
        block_time: u32,
        coinstake: bool,
    ) -> Result<(), ConsensusError> {
        if !tx.is_coinbase() {
            for input in &tx.vin {
                let spent = self
                    .entries
                    .get_mut(&input.prevout.hash)
                    .and_then(|entry| {
                        entry.touched = true;
                        entry.current.as_mut()
                    })
                    .and_then(|coins| coins.spend(input.prevout.index));
                if spent.is_none() {
                    return Err(ConsensusError::new(ErrorCode::BadTxnsInputsMissingOrSpent));
                }
            }
        }

        let record = UnspentOutputs::from_transaction(tx, txid, height, block_time, coinstake);
        let entry = self.entries.entry(txid).or_insert(ViewEntry {
            current: None,
            original: None,
            touched: false,
        });
        entry.current = Some(record);
        entry.touched = true;
        Ok(())
    }

    /// Final state of every touched record plus the data needed to undo
    /// this block.
    pub fn into_changes(self, height: u32, previous_tip: Hash256) -> (Vec<UnspentOutputs>, RewindData) {
        let mut touched: Vec<(Hash256, ViewEntry)> = self
            .entries
            .into_iter()
            .filter(|(_, entry)| entry.touched)
            .collect();
        touched.sort_by(|left, right| left.0.cmp(&right.0));

        let mut outputs = Vec::with_capacity(touched.len());
        let mut rewind = RewindData {
            height,
            previous_tip,
            restore: Vec::new(),
            remove: Vec::new(),
        };
        for (txid, entry) in touched {
            outputs.push(
                entry
                    .current
                    .unwrap_or_else(|| UnspentOutputs::pruned(txid)),
            );
            match entry.original {
                Some(original) if !original.is_fully_spent() => rewind.restore.push(original),
                _ => rewind.remove.push(txid),
            }
        }
        (outputs, rewind)
    }
}
