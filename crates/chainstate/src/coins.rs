//! Persistent coin store with one rewind record per connected block.

use std::fmt;

use hybridd_consensus::Hash256;
use hybridd_primitives::encoding::{DecodeError, Decoder, Encoder};
use hybridd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::utxo::UnspentOutputs;

const TIP_KEY: &[u8] = b"coins_tip";

#[derive(Debug)]
pub enum CoinViewError {
    Store(StoreError),
    Decode(DecodeError),
    TipMismatch { expected: Hash256, found: Hash256 },
    NotInitialized,
    NothingToRewind,
    MissingRewindData(u32),
    Poisoned,
}

impl fmt::Display for CoinViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinViewError::Store(err) => write!(f, "{err}"),
            CoinViewError::Decode(err) => write!(f, "coin record: {err}"),
            CoinViewError::TipMismatch { expected, found } => write!(
                f,
                "coin view tip is {} but save expected {}",
                hybridd_consensus::hash256_to_hex(found),
                hybridd_consensus::hash256_to_hex(expected)
            ),
            CoinViewError::NotInitialized => write!(f, "coin store has no tip"),
            CoinViewError::NothingToRewind => write!(f, "coin store is at genesis"),
            CoinViewError::MissingRewindData(height) => {
                write!(f, "no rewind record at height {height}")
            }
            CoinViewError::Poisoned => write!(f, "coin view lock poisoned"),
        }
    }
}

impl std::error::Error for CoinViewError {}

impl From<StoreError> for CoinViewError {
    fn from(err: StoreError) -> Self {
        CoinViewError::Store(err)
    }
}

impl From<DecodeError> for CoinViewError {
    fn from(err: DecodeError) -> Self {
        CoinViewError::Decode(err)
    }
}

/// The block the coin set currently reflects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoinTip {
    pub hash: Hash256,
    pub height: u32,
}

impl CoinTip {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(36);
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.height);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let hash = decoder.read_hash()?;
        let height = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { hash, height })
    }
}

/// Undo information for the block connected at `height`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RewindData {
    pub height: u32,
    pub previous_tip: Hash256,
    /// Records as they were before the block touched them.
    pub restore: Vec<UnspentOutputs>,
    /// Records the block created from nothing.
    pub remove: Vec<Hash256>,
}

impl RewindData {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.height);
        encoder.write_hash(&self.previous_tip);
        encoder.write_varint(self.restore.len() as u64);
        for record in &self.restore {
            encoder.write_hash(&record.txid);
            encoder.write_var_bytes(&record.encode());
        }
        encoder.write_varint(self.remove.len() as u64);
        for txid in &self.remove {
            encoder.write_hash(txid);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_u32_le()?;
        let previous_tip = decoder.read_hash()?;
        let restore_count = decoder.read_varint()?;
        let mut restore = Vec::with_capacity(restore_count.min(4096) as usize);
        for _ in 0..restore_count {
            let txid = decoder.read_hash()?;
            let bytes = decoder.read_var_bytes()?;
            restore.push(UnspentOutputs::decode(txid, &bytes)?);
        }
        let remove_count = decoder.read_varint()?;
        let mut remove = Vec::with_capacity(remove_count.min(4096) as usize);
        for _ in 0..remove_count {
            remove.push(decoder.read_hash()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            height,
            previous_tip,
            restore,
            remove,
        })
    }
}

/// The coin view contract shared by the persistent store and the cache.
pub trait CoinStore: Send + Sync {
    /// Records for `ids`, in order; `None` for unknown or fully spent ids.
    fn fetch(&self, ids: &[Hash256]) -> Result<Vec<Option<UnspentOutputs>>, CoinViewError>;

    fn tip(&self) -> Result<CoinTip, CoinViewError>;

    fn current_tip_hash(&self) -> Result<Hash256, CoinViewError> {
        self.tip().map(|tip| tip.hash)
    }

    /// Applies `outputs` (fully spent records are deleted) and `rewind`, and
    /// moves the tip from `previous_tip` to `new_tip` in one atomic write.
    fn save(
        &self,
        outputs: &[UnspentOutputs],
        rewind: &[RewindData],
        previous_tip: &Hash256,
        new_tip: CoinTip,
    ) -> Result<(), CoinViewError>;

    /// Undoes the most recent block and returns the restored tip.
    fn rewind(&self) -> Result<CoinTip, CoinViewError>;

    /// Sets the tip of an empty store to the genesis block.
    fn initialize(&self, genesis: &Hash256) -> Result<CoinTip, CoinViewError>;
}

/// [`CoinStore`] over a column-oriented key/value backend.
pub struct KvCoinStore<S> {
    store: S,
}

impl<S: KeyValueStore> KvCoinStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn read_tip(&self) -> Result<Option<CoinTip>, CoinViewError> {
        match self.store.get(Column::Meta, TIP_KEY)? {
            Some(bytes) => Ok(Some(CoinTip::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn rewind_key(height: u32) -> [u8; 4] {
        height.to_be_bytes()
    }

    fn put_record(batch: &mut WriteBatch, record: &UnspentOutputs) {
        if record.is_fully_spent() {
            batch.delete(Column::Coins, &record.txid);
        } else {
            batch.put(Column::Coins, &record.txid, record.encode());
        }
    }
}

impl<S: KeyValueStore> CoinStore for KvCoinStore<S> {
    fn fetch(&self, ids: &[Hash256]) -> Result<Vec<Option<UnspentOutputs>>, CoinViewError> {
        let keys: Vec<&[u8]> = ids.iter().map(|id| id.as_slice()).collect();
        let values = self.store.multi_get(Column::Coins, &keys)?;
        ids.iter()
            .zip(values)
            .map(|(id, value)| match value {
                Some(bytes) => Ok(Some(UnspentOutputs::decode(*id, &bytes)?)),
                None => Ok(None),
            })
            .collect()
    }

    fn tip(&self) -> Result<CoinTip, CoinViewError> {
        self.read_tip()?.ok_or(CoinViewError::NotInitialized)
    }

    fn save(
        &self,
        outputs: &[UnspentOutputs],
        rewind: &[RewindData],
        previous_tip: &Hash256,
        new_tip: CoinTip,
    ) -> Result<(), CoinViewError> {
        let current = self.tip()?;
        if current.hash != *previous_tip {
            return Err(CoinViewError::TipMismatch {
                expected: *previous_tip,
                found: current.hash,
            });
        }

        let mut batch = WriteBatch::new();
        for record in outputs {
            Self::put_record(&mut batch, record);
        }
        for data in rewind {
            batch.put(
                Column::CoinsRewind,
                &Self::rewind_key(data.height),
                data.encode(),
            );
        }
        batch.put(Column::Meta, TIP_KEY, new_tip.encode());
        self.store.write_batch(&batch)?;
        Ok(())
    }

    fn rewind(&self) -> Result<CoinTip, CoinViewError> {
        let current = self.tip()?;
        if current.height == 0 {
            return Err(CoinViewError::NothingToRewind);
        }
        let key = Self::rewind_key(current.height);
        let bytes = self
            .store
            .get(Column::CoinsRewind, &key)?
            .ok_or(CoinViewError::MissingRewindData(current.height))?;
        let data = RewindData::decode(&bytes)?;

        let mut batch = WriteBatch::new();
        for txid in &data.remove {
            batch.delete(Column::Coins, txid);
        }
        for record in &data.restore {
            Self::put_record(&mut batch, record);
        }
        batch.delete(Column::CoinsRewind, &key);
        let restored = CoinTip {
            hash: data.previous_tip,
            height: current.height - 1,
        };
        batch.put(Column::Meta, TIP_KEY, restored.encode());
        self.store.write_batch(&batch)?;

        hybridd_log::log_debug!(
            "coin store rewound from height {} to {}",
            current.height,
            restored.height
        );
        Ok(restored)
    }

    fn initialize(&self, genesis: &Hash256) -> Result<CoinTip, CoinViewError> {
        if let Some(tip) = self.read_tip()? {
            return Ok(tip);
        }
        let tip = CoinTip {
            hash: *genesis,
            height: 0,
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, TIP_KEY, tip.encode());
        self.store.write_batch(&batch)?;
        Ok(tip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_primitives::transaction::TxOut;
    use hybridd_storage::memory::MemoryStore;

    fn record(txid: Hash256, height: u32, outputs: Vec<Option<TxOut>>) -> UnspentOutputs {
        UnspentOutputs {
            txid,
            height,
            coinbase: false,
            coinstake: false,
            time: 0,
            outputs,
        }
    }

    #[test]
    fn save_then_rewind_restores_previous_records() {
        let coins = KvCoinStore::new(MemoryStore::new());
        let genesis = [0xaa; 32];
        coins.initialize(&genesis).expect("init");

        let funding = record([1; 32], 1, vec![Some(TxOut::new(50, vec![0x51]))]);
        coins
            .save(
                &[funding.clone()],
                &[RewindData {
                    height: 1,
                    previous_tip: genesis,
                    restore: Vec::new(),
                    remove: vec![funding.txid],
                }],
                &genesis,
                CoinTip {
                    hash: [0xb1; 32],
                    height: 1,
                },
            )
            .expect("save block 1");

        let mut spent = funding.clone();
        spent.spend(0);
        let child = record([2; 32], 2, vec![Some(TxOut::new(49, vec![0x51]))]);
        coins
            .save(
                &[spent, child.clone()],
                &[RewindData {
                    height: 2,
                    previous_tip: [0xb1; 32],
                    restore: vec![funding.clone()],
                    remove: vec![child.txid],
                }],
                &[0xb1; 32],
                CoinTip {
                    hash: [0xb2; 32],
                    height: 2,
                },
            )
            .expect("save block 2");
        assert_eq!(
            coins.fetch(&[funding.txid, child.txid]).expect("fetch"),
            vec![None, Some(child.clone())]
        );

        let restored = coins.rewind().expect("rewind");
        assert_eq!(restored.hash, [0xb1; 32]);
        assert_eq!(
            coins.fetch(&[funding.txid, child.txid]).expect("fetch"),
            vec![Some(funding), None]
        );
        assert_eq!(coins.rewind().expect("rewind").hash, genesis);
        assert!(matches!(coins.rewind(), Err(CoinViewError::NothingToRewind)));
    }

    #[test]
    fn save_rejects_stale_previous_tip() {
        let coins = KvCoinStore::new(MemoryStore::new());
        coins.initialize(&[1; 32]).expect("init");
        let err = coins
            .save(
                &[],
                &[],
                &[9; 32],
                CoinTip {
                    hash: [2; 32],
                    height: 1,
                },
            )
            .expect_err("stale tip");
        assert!(matches!(err, CoinViewError::TipMismatch { .. }));
    }

    #[test]
    fn initialize_keeps_an_existing_tip() {
        let coins = KvCoinStore::new(MemoryStore::new());
        assert!(matches!(coins.tip(), Err(CoinViewError::NotInitialized)));
        coins.initialize(&[1; 32]).expect("init");
        assert_eq!(coins.initialize(&[2; 32]).expect("again").hash, [1; 32]);
    }
}
