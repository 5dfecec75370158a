//! Per-block proof-of-stake metadata and its in-memory working set.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use hybridd_consensus::Hash256;
use hybridd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use hybridd_primitives::outpoint::OutPoint;
use hybridd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const STAKE_FLAG_PROOF_OF_STAKE: u32 = 1 << 0;
pub const STAKE_FLAG_ENTROPY: u32 = 1 << 1;
pub const STAKE_FLAG_MODIFIER: u32 = 1 << 2;

#[derive(Debug)]
pub enum StakeError {
    Store(StoreError),
    Decode(DecodeError),
    Poisoned,
}

impl fmt::Display for StakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StakeError::Store(err) => write!(f, "{err}"),
            StakeError::Decode(err) => write!(f, "stake record: {err}"),
            StakeError::Poisoned => write!(f, "stake chain lock poisoned"),
        }
    }
}

impl std::error::Error for StakeError {}

impl From<StoreError> for StakeError {
    fn from(err: StoreError) -> Self {
        StakeError::Store(err)
    }
}

impl From<DecodeError> for StakeError {
    fn from(err: DecodeError) -> Self {
        StakeError::Decode(err)
    }
}

/// Stake proof data recorded for every block on a stake network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockStake {
    pub flags: u32,
    /// Block hash for proof-of-work blocks, kernel hash for stake blocks.
    pub hash_proof: Hash256,
    pub stake_modifier_v2: Hash256,
    /// The staked output; null for proof-of-work blocks.
    pub prevout_stake: OutPoint,
    pub stake_time: u32,
}

impl Default for BlockStake {
    fn default() -> Self {
        Self::proof_of_work([0u8; 32])
    }
}

impl BlockStake {
    pub fn proof_of_work(block_hash: Hash256) -> Self {
        Self {
            flags: 0,
            hash_proof: block_hash,
            stake_modifier_v2: [0u8; 32],
            prevout_stake: OutPoint::null(),
            stake_time: 0,
        }
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & STAKE_FLAG_PROOF_OF_STAKE != 0
    }

    pub fn stake_entropy_bit(&self) -> bool {
        self.flags & STAKE_FLAG_ENTROPY != 0
    }

    /// The hash the next stake modifier is chained from.
    pub fn kernel_selector(&self) -> Hash256 {
        if self.is_proof_of_stake() {
            self.prevout_stake.hash
        } else {
            self.hash_proof
        }
    }
}

/// A stake record keyed by its block, with its persistence state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StakeItem {
    pub block_hash: Hash256,
    pub height: u32,
    pub stake: BlockStake,
    pub in_store: bool,
}

impl StakeItem {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(4 + 4 + 32 + 32 + 36 + 4);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.stake.flags);
        encoder.write_hash(&self.stake.hash_proof);
        encoder.write_hash(&self.stake.stake_modifier_v2);
        self.stake.prevout_stake.consensus_encode(&mut encoder);
        encoder.write_u32_le(self.stake.stake_time);
        encoder.into_inner()
    }

    pub fn decode(block_hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_u32_le()?;
        let flags = decoder.read_u32_le()?;
        let hash_proof = decoder.read_hash()?;
        let stake_modifier_v2 = decoder.read_hash()?;
        let prevout_stake = OutPoint::consensus_decode(&mut decoder)?;
        let stake_time = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            block_hash,
            height,
            stake: BlockStake {
                flags,
                hash_proof,
                stake_modifier_v2,
                prevout_stake,
                stake_time,
            },
            in_store: true,
        })
    }
}

/// Batched persistence for stake records.
pub trait StakeStore: Send + Sync {
    fn get(&self, ids: &[Hash256]) -> Result<Vec<Option<StakeItem>>, StakeError>;
    fn put(&self, items: &[StakeItem]) -> Result<(), StakeError>;
}

pub struct KvStakeStore<S> {
    store: S,
}

impl<S: KeyValueStore> KvStakeStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> StakeStore for KvStakeStore<S> {
    fn get(&self, ids: &[Hash256]) -> Result<Vec<Option<StakeItem>>, StakeError> {
        let keys: Vec<&[u8]> = ids.iter().map(|id| id.as_slice()).collect();
        let values = self.store.multi_get(Column::Stake, &keys)?;
        ids.iter()
            .zip(values)
            .map(|(id, value)| match value {
                Some(bytes) => Ok(Some(StakeItem::decode(*id, &bytes)?)),
                None => Ok(None),
            })
            .collect()
    }

    fn put(&self, items: &[StakeItem]) -> Result<(), StakeError> {
        let mut batch = WriteBatch::new();
        for item in items {
            batch.put(Column::Stake, &item.block_hash, item.encode());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

struct WorkingSet {
    items: HashMap<Hash256, StakeItem>,
    by_height: BTreeSet<(u32, Hash256)>,
}

impl WorkingSet {
    fn insert(&mut self, item: StakeItem) {
        if let Some(previous) = self.items.get(&item.block_hash) {
            self.by_height.remove(&(previous.height, previous.block_hash));
        }
        self.by_height.insert((item.height, item.block_hash));
        self.items.insert(item.block_hash, item);
    }

    fn remove(&mut self, hash: &Hash256) {
        if let Some(item) = self.items.remove(hash) {
            self.by_height.remove(&(item.height, item.block_hash));
        }
    }
}

/// The oldest tenth (by height) of a working set that has grown past
/// `max_items`; nothing when it has not.
pub fn eviction_candidates(by_height: &BTreeSet<(u32, Hash256)>, max_items: usize) -> Vec<Hash256> {
    if by_height.len() <= max_items {
        return Vec::new();
    }
    let count = by_height.len().div_ceil(10).max(by_height.len() - max_items);
    by_height
        .iter()
        .take(count)
        .map(|(_, hash)| *hash)
        .collect()
}

/// Stake records for the chain: reads resolve from memory and fall through to
/// the store; writes buffer until the working set outgrows its bound.
pub struct StakeChainStore {
    store: Arc<dyn StakeStore>,
    state: Mutex<WorkingSet>,
    max_items: usize,
    genesis: StakeItem,
}

impl StakeChainStore {
    pub fn new(store: Arc<dyn StakeStore>, genesis_hash: Hash256, max_items: usize) -> Self {
        let genesis = StakeItem {
            block_hash: genesis_hash,
            height: 0,
            stake: BlockStake::proof_of_work(genesis_hash),
            in_store: false,
        };
        let mut working = WorkingSet {
            items: HashMap::new(),
            by_height: BTreeSet::new(),
        };
        working.insert(genesis.clone());
        Self {
            store,
            state: Mutex::new(working),
            max_items: max_items.max(1),
            genesis,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, WorkingSet>, StakeError> {
        self.state.lock().map_err(|_| StakeError::Poisoned)
    }

    pub fn genesis(&self) -> &StakeItem {
        &self.genesis
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, block_hash: &Hash256) -> Result<Option<BlockStake>, StakeError> {
        Ok(self
            .get_many(std::slice::from_ref(block_hash))?
            .pop()
            .flatten()
            .map(|item| item.stake))
    }

    pub fn get_item(&self, block_hash: &Hash256) -> Result<Option<StakeItem>, StakeError> {
        Ok(self.get_many(std::slice::from_ref(block_hash))?.pop().flatten())
    }

    /// Looks `ids` up in memory first, then in one batched store read.
    pub fn get_many(&self, ids: &[Hash256]) -> Result<Vec<Option<StakeItem>>, StakeError> {
        let mut found: Vec<Option<StakeItem>> = {
            let state = self.lock()?;
            ids.iter().map(|id| state.items.get(id).cloned()).collect()
        };
        let missing: Vec<Hash256> = ids
            .iter()
            .zip(&found)
            .filter(|(_, item)| item.is_none())
            .map(|(id, _)| *id)
            .collect();
        if missing.is_empty() {
            return Ok(found);
        }

        let mut loaded = self.store.get(&missing)?.into_iter();
        for slot in found.iter_mut().filter(|slot| slot.is_none()) {
            *slot = loaded.next().flatten();
        }
        Ok(found)
    }

    pub fn set(&self, block_hash: Hash256, height: u32, stake: BlockStake) -> Result<(), StakeError> {
        let oversized = {
            let mut state = self.lock()?;
            state.insert(StakeItem {
                block_hash,
                height,
                stake,
                in_store: false,
            });
            state.items.len() > self.max_items
        };
        if oversized {
            self.flush(false)?;
        }
        Ok(())
    }

    /// Persists buffered records when forced or once the working set is over
    /// its bound; only the latter evicts. Returns how many records were written.
    pub fn flush(&self, force: bool) -> Result<usize, StakeError> {
        let mut state = self.lock()?;
        let oversized = state.items.len() > self.max_items;
        if !force && !oversized {
            return Ok(0);
        }
        let pending: Vec<StakeItem> = state
            .items
            .values()
            .filter(|item| !item.in_store)
            .cloned()
            .collect();
        if !pending.is_empty() {
            self.store.put(&pending)?;
            for item in state.items.values_mut() {
                item.in_store = true;
            }
        }

        if oversized {
            let evicted = eviction_candidates(&state.by_height, self.max_items);
            for hash in &evicted {
                state.remove(hash);
            }
            if !evicted.is_empty() {
                hybridd_log::log_debug!(
                    "stake chain evicted {} records, {} remain",
                    evicted.len(),
                    state.items.len()
                );
            }
        }
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_storage::memory::MemoryStore;

    fn pos_stake(seed: u8) -> BlockStake {
        BlockStake {
            flags: STAKE_FLAG_PROOF_OF_STAKE | STAKE_FLAG_MODIFIER,
            hash_proof: [seed; 32],
            stake_modifier_v2: [seed.wrapping_add(1); 32],
            prevout_stake: OutPoint::new([seed.wrapping_add(2); 32], 1),
            stake_time: 1_700_000_000 + u32::from(seed),
        }
    }

    fn hash(height: u32) -> Hash256 {
        let mut out = [0u8; 32];
        out[..4].copy_from_slice(&height.to_le_bytes());
        out[31] = 0xbb;
        out
    }

    #[test]
    fn record_encoding_round_trips() {
        let item = StakeItem {
            block_hash: [9; 32],
            height: 77,
            stake: pos_stake(4),
            in_store: true,
        };
        let decoded = StakeItem::decode(item.block_hash, &item.encode()).expect("decode");
        assert_eq!(decoded, item);
        assert_eq!(decoded.stake.kernel_selector(), [6; 32]);
    }

    #[test]
    fn genesis_is_seeded() {
        let store = Arc::new(KvStakeStore::new(MemoryStore::new()));
        let chain = StakeChainStore::new(store, [1; 32], 16);
        let genesis = chain.get(&[1; 32]).expect("get").expect("seeded");
        assert!(!genesis.is_proof_of_stake());
        assert_eq!(genesis.stake_modifier_v2, [0; 32]);
    }

    #[test]
    fn default_record_is_a_work_block() {
        let stake = BlockStake::default();
        assert!(!stake.is_proof_of_stake());
        assert!(stake.prevout_stake.is_null());
        assert_eq!(stake, BlockStake::proof_of_work([0; 32]));
    }

    #[test]
    fn reads_fall_through_to_the_store() {
        let backing = Arc::new(MemoryStore::new());
        let store = Arc::new(KvStakeStore::new(Arc::clone(&backing)));
        let chain = StakeChainStore::new(store.clone(), [1; 32], 16);
        chain.set(hash(1), 1, pos_stake(1)).expect("set");
        assert_eq!(chain.flush(false).expect("flush"), 0);
        assert_eq!(backing.len(Column::Stake), 0);
        assert_eq!(chain.flush(true).expect("flush"), 2);
        assert_eq!(backing.len(Column::Stake), 2);
        assert_eq!(chain.len(), 2);

        let reopened = StakeChainStore::new(store, [1; 32], 16);
        assert_eq!(reopened.get(&hash(1)).expect("get"), Some(pos_stake(1)));
        assert_eq!(reopened.get(&hash(2)).expect("get"), None);
    }

    #[test]
    fn overflowing_set_persists_and_evicts_oldest() {
        let backing = Arc::new(MemoryStore::new());
        let store = Arc::new(KvStakeStore::new(Arc::clone(&backing)));
        let chain = StakeChainStore::new(store, [1; 32], 20);
        for height in 1..=20 {
            chain.set(hash(height), height, pos_stake(height as u8)).expect("set");
        }
        // genesis plus 20 blocks crossed the bound of 20
        assert_eq!(backing.len(Column::Stake), 21);
        assert_eq!(chain.len(), 18);
        assert_eq!(chain.get(&hash(1)).expect("get"), Some(pos_stake(1)));
        assert_eq!(chain.get(&hash(20)).expect("get"), Some(pos_stake(20)));
    }

    #[test]
    fn eviction_takes_the_lowest_tenth() {
        let index: BTreeSet<(u32, Hash256)> = (0..50u32).map(|h| (h, hash(h))).collect();
        assert!(eviction_candidates(&index, 50).is_empty());
        let evicted = eviction_candidates(&index, 40);
        assert_eq!(evicted.len(), 10);
        assert_eq!(evicted[0], hash(0));
        assert_eq!(evicted[9], hash(9));
        assert_eq!(eviction_candidates(&index, 48).len(), 5);
    }
}
