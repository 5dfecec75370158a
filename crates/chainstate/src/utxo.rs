//! Per-transaction unspent output records.

use hybridd_consensus::money::Amount;
use hybridd_consensus::Hash256;
use hybridd_primitives::encoding::{DecodeError, Decoder, Encoder};
use hybridd_primitives::transaction::{Transaction, TxOut};

const FLAG_COINBASE: u8 = 1 << 0;
const FLAG_COINSTAKE: u8 = 1 << 1;

/// The outputs of one transaction that are still spendable. Spent slots are
/// `None`; the record stays until every slot is spent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnspentOutputs {
    pub txid: Hash256,
    pub height: u32,
    pub coinbase: bool,
    pub coinstake: bool,
    /// Transaction timestamp on stake networks, block time otherwise.
    pub time: u32,
    pub outputs: Vec<Option<TxOut>>,
}

impl UnspentOutputs {
    /// `coinstake` comes from the network: a PoW chain never marks one.
    pub fn from_transaction(
        tx: &Transaction,
        txid: Hash256,
        height: u32,
        block_time: u32,
        coinstake: bool,
    ) -> Self {
        Self {
            txid,
            height,
            coinbase: tx.is_coinbase(),
            coinstake,
            time: tx.time.unwrap_or(block_time),
            outputs: tx.vout.iter().cloned().map(Some).collect(),
        }
    }

    /// A record with nothing left to spend; persisting it deletes the entry.
    pub fn pruned(txid: Hash256) -> Self {
        Self {
            txid,
            height: 0,
            coinbase: false,
            coinstake: false,
            time: 0,
            outputs: Vec::new(),
        }
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    /// Marks `index` spent and returns what it held.
    pub fn spend(&mut self, index: u32) -> Option<TxOut> {
        self.outputs.get_mut(index as usize).and_then(Option::take)
    }

    pub fn unspent_count(&self) -> usize {
        self.outputs.iter().filter(|output| output.is_some()).count()
    }

    pub fn is_fully_spent(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn unspent_value(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .flatten()
            .try_fold(0i64, |acc, output| acc.checked_add(output.value))
    }

    /// Coinbase and coinstake outputs need `maturity` blocks on top of them.
    pub fn is_mature(&self, spend_height: u32, maturity: u32) -> bool {
        if !self.coinbase && !self.coinstake {
            return true;
        }
        spend_height.saturating_sub(self.height) >= maturity
    }

    /// `height ∥ flags ∥ time ∥ count ∥ spent bitmask ∥ unspent outputs`.
    /// A set bit marks an unspent slot.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16 + self.outputs.len() * 34);
        encoder.write_u32_le(self.height);
        let mut flags = 0u8;
        if self.coinbase {
            flags |= FLAG_COINBASE;
        }
        if self.coinstake {
            flags |= FLAG_COINSTAKE;
        }
        encoder.write_u8(flags);
        encoder.write_u32_le(self.time);
        encoder.write_varint(self.outputs.len() as u64);

        let mut mask = vec![0u8; self.outputs.len().div_ceil(8)];
        for (index, output) in self.outputs.iter().enumerate() {
            if output.is_some() {
                mask[index / 8] |= 1 << (index % 8);
            }
        }
        encoder.write_bytes(&mask);
        for output in self.outputs.iter().flatten() {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.into_inner()
    }

    pub fn decode(txid: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_u32_le()?;
        let flags = decoder.read_u8()?;
        let time = decoder.read_u32_le()?;
        let count = decoder.read_varint()? as usize;
        let mask = decoder.read_bytes(count.div_ceil(8))?;

        let mut outputs = Vec::with_capacity(count.min(4096));
        for index in 0..count {
            if mask[index / 8] & (1 << (index % 8)) == 0 {
                outputs.push(None);
                continue;
            }
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            outputs.push(Some(TxOut::new(value, script_pubkey)));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            txid,
            height,
            coinbase: flags & FLAG_COINBASE != 0,
            coinstake: flags & FLAG_COINSTAKE != 0,
            time,
            outputs,
        })
    }
}
