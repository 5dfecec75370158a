//! In-memory header tree with a settable best chain.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hybridd_consensus::constants::MEDIAN_TIME_SPAN;
use hybridd_consensus::Hash256;
use hybridd_pow::difficulty::{block_proof, CompactError};
use hybridd_pow::HeaderInfo;
use hybridd_pos::RetargetHeader;
use hybridd_primitives::block::BlockHeader;
use primitive_types::U256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    UnknownParent(Hash256),
    UnknownHeader(Hash256),
    Compact(CompactError),
    Poisoned,
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::UnknownParent(hash) => write!(
                f,
                "parent {} not in header index",
                hybridd_consensus::hash256_to_hex(hash)
            ),
            IndexError::UnknownHeader(hash) => write!(
                f,
                "header {} not in header index",
                hybridd_consensus::hash256_to_hex(hash)
            ),
            IndexError::Compact(err) => write!(f, "{err}"),
            IndexError::Poisoned => write!(f, "header index lock poisoned"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<CompactError> for IndexError {
    fn from(err: CompactError) -> Self {
        IndexError::Compact(err)
    }
}

/// A header with its position in the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainedHeader {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u32,
    pub chain_work: U256,
    pub prev: Option<Hash256>,
    pub proof_of_stake: bool,
}

impl ChainedHeader {
    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: self.height,
            time: self.header.time,
            bits: self.header.bits,
        }
    }

    pub fn retarget_header(&self) -> RetargetHeader {
        RetargetHeader {
            height: self.height,
            time: self.header.time,
            bits: self.header.bits,
            proof_of_stake: self.proof_of_stake,
        }
    }
}

struct IndexState {
    headers: HashMap<Hash256, Arc<ChainedHeader>>,
    /// Best chain hashes by height.
    best: Vec<Hash256>,
}

impl IndexState {
    fn walk_back(&self, from: &Arc<ChainedHeader>, height: u32) -> Option<Arc<ChainedHeader>> {
        if height > from.height {
            return None;
        }
        if self.best.get(from.height as usize) == Some(&from.hash) {
            let hash = self.best.get(height as usize)?;
            return self.headers.get(hash).cloned();
        }
        let mut cursor = Arc::clone(from);
        while cursor.height > height {
            let prev = cursor.prev?;
            if self.best.get(cursor.height as usize - 1) == Some(&prev) {
                let hash = self.best.get(height as usize)?;
                return self.headers.get(hash).cloned();
            }
            cursor = Arc::clone(self.headers.get(&prev)?);
        }
        Some(cursor)
    }
}

/// Header lookup by hash or height, cumulative work, and the best chain.
pub struct ChainIndexer {
    state: RwLock<IndexState>,
    genesis: Arc<ChainedHeader>,
}

impl ChainIndexer {
    pub fn new(genesis: BlockHeader, proof_of_stake: bool) -> Result<Self, IndexError> {
        let hash = genesis.hash();
        let chain_work = block_proof(genesis.bits)?;
        let genesis = Arc::new(ChainedHeader {
            hash,
            header: genesis,
            height: 0,
            chain_work,
            prev: None,
            proof_of_stake,
        });
        let mut headers = HashMap::new();
        headers.insert(hash, Arc::clone(&genesis));
        Ok(Self {
            state: RwLock::new(IndexState {
                headers,
                best: vec![hash],
            }),
            genesis,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>, IndexError> {
        self.state.read().map_err(|_| IndexError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>, IndexError> {
        self.state.write().map_err(|_| IndexError::Poisoned)
    }

    pub fn genesis(&self) -> &Arc<ChainedHeader> {
        &self.genesis
    }

    /// Links `header` under its parent. Adding a known header is a no-op.
    pub fn add_header(
        &self,
        header: BlockHeader,
        proof_of_stake: bool,
    ) -> Result<Arc<ChainedHeader>, IndexError> {
        let hash = header.hash();
        let mut state = self.write()?;
        if let Some(existing) = state.headers.get(&hash) {
            return Ok(Arc::clone(existing));
        }
        let parent = state
            .headers
            .get(&header.prev_block)
            .cloned()
            .ok_or(IndexError::UnknownParent(header.prev_block))?;
        let chain_work = parent.chain_work.saturating_add(block_proof(header.bits)?);
        let entry = Arc::new(ChainedHeader {
            hash,
            height: parent.height + 1,
            chain_work,
            prev: Some(parent.hash),
            proof_of_stake,
            header,
        });
        state.headers.insert(hash, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, hash: &Hash256) -> Option<Arc<ChainedHeader>> {
        self.read().ok()?.headers.get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.read()
            .map(|state| state.headers.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.read().map(|state| state.headers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn best_tip(&self) -> Arc<ChainedHeader> {
        self.read()
            .ok()
            .and_then(|state| {
                let hash = state.best.last()?;
                state.headers.get(hash).cloned()
            })
            .unwrap_or_else(|| Arc::clone(&self.genesis))
    }

    pub fn best_height(&self) -> u32 {
        self.best_tip().height
    }

    /// Makes the chain ending at `hash` the best chain.
    pub fn set_best_tip(&self, hash: &Hash256) -> Result<Arc<ChainedHeader>, IndexError> {
        let mut state = self.write()?;
        let tip = state
            .headers
            .get(hash)
            .cloned()
            .ok_or(IndexError::UnknownHeader(*hash))?;

        let mut branch = Vec::new();
        let mut cursor = Arc::clone(&tip);
        while state.best.get(cursor.height as usize) != Some(&cursor.hash) {
            branch.push(cursor.hash);
            let Some(prev) = cursor.prev else {
                break;
            };
            cursor = state
                .headers
                .get(&prev)
                .cloned()
                .ok_or(IndexError::UnknownHeader(prev))?;
        }
        let fork = tip.height as usize + 1 - branch.len();
        state.best.truncate(fork);
        state.best.extend(branch.into_iter().rev());
        Ok(tip)
    }

    /// The known header with the most cumulative work.
    pub fn most_work_tip(&self) -> Arc<ChainedHeader> {
        let best = self.best_tip();
        self.read()
            .ok()
            .and_then(|state| {
                state
                    .headers
                    .values()
                    .filter(|entry| entry.chain_work > best.chain_work)
                    .max_by(|left, right| {
                        left.chain_work
                            .cmp(&right.chain_work)
                            .then_with(|| right.height.cmp(&left.height))
                    })
                    .cloned()
            })
            .unwrap_or(best)
    }

    pub fn at_height(&self, height: u32) -> Option<Arc<ChainedHeader>> {
        let state = self.read().ok()?;
        let hash = state.best.get(height as usize)?;
        state.headers.get(hash).cloned()
    }

    /// Ancestor of `hash` at `height` on its own branch.
    pub fn ancestor(&self, hash: &Hash256, height: u32) -> Option<Arc<ChainedHeader>> {
        let state = self.read().ok()?;
        let from = state.headers.get(hash)?;
        state.walk_back(from, height)
    }

    pub fn is_on_best_chain(&self, hash: &Hash256) -> bool {
        let Some(entry) = self.get(hash) else {
            return false;
        };
        self.read()
            .map(|state| state.best.get(entry.height as usize) == Some(hash))
            .unwrap_or(false)
    }

    /// Median of the last eleven block times ending at `hash`.
    pub fn median_time_past(&self, hash: &Hash256) -> Option<u32> {
        let state = self.read().ok()?;
        let mut cursor = state.headers.get(hash).cloned();
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        while let Some(entry) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(entry.header.time);
            cursor = entry.prev.and_then(|prev| state.headers.get(&prev).cloned());
        }
        if times.is_empty() {
            return None;
        }
        times.sort_unstable();
        Some(times[times.len() / 2])
    }

    /// The highest common ancestor of `left` and `right`.
    pub fn fork_point(&self, left: &Hash256, right: &Hash256) -> Option<Arc<ChainedHeader>> {
        let state = self.read().ok()?;
        let mut a = state.headers.get(left).cloned()?;
        let mut b = state.headers.get(right).cloned()?;
        if a.height > b.height {
            a = state.walk_back(&a, b.height)?;
        } else if b.height > a.height {
            b = state.walk_back(&b, a.height)?;
        }
        while a.hash != b.hash {
            a = state.headers.get(&a.prev?).cloned()?;
            b = state.headers.get(&b.prev?).cloned()?;
        }
        Some(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BITS: u32 = 0x207f_ffff;

    fn header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: BITS,
            nonce,
        }
    }

    fn extend(index: &ChainIndexer, from: Hash256, count: u32, salt: u32) -> Vec<Hash256> {
        let mut prev = from;
        let mut hashes = Vec::new();
        let start = index.get(&from).expect("known").header.time;
        for step in 1..=count {
            let entry = index
                .add_header(header(prev, start + step * 60, salt), false)
                .expect("add");
            prev = entry.hash;
            hashes.push(entry.hash);
        }
        hashes
    }

    fn setup() -> (ChainIndexer, Hash256) {
        let genesis = header([0u8; 32], 1_000_000, 0);
        let hash = genesis.hash();
        (ChainIndexer::new(genesis, false).expect("genesis"), hash)
    }

    #[test]
    fn heights_and_work_accumulate() {
        let (index, genesis) = setup();
        let chain = extend(&index, genesis, 3, 0);
        let tip = index.get(&chain[2]).expect("tip");
        assert_eq!(tip.height, 3);
        let unit = block_proof(BITS).expect("proof");
        assert_eq!(tip.chain_work, unit * U256::from(4u8));
        assert_eq!(index.ancestor(&chain[2], 1).map(|h| h.hash), Some(chain[0]));
        assert!(index.ancestor(&chain[0], 2).is_none());
    }

    #[test]
    fn unknown_parent_is_rejected_and_add_is_idempotent() {
        let (index, genesis) = setup();
        let orphan = header([9u8; 32], 5, 0);
        assert_eq!(
            index.add_header(orphan, false),
            Err(IndexError::UnknownParent([9u8; 32]))
        );
        let first = index.add_header(header(genesis, 2_000_000, 1), false).expect("add");
        let again = index.add_header(header(genesis, 2_000_000, 1), false).expect("add");
        assert_eq!(first, again);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn best_tip_switches_branches() {
        let (index, genesis) = setup();
        let main = extend(&index, genesis, 2, 0);
        index.set_best_tip(&main[1]).expect("set");
        assert_eq!(index.best_height(), 2);
        assert!(index.is_on_best_chain(&main[0]));

        let side = extend(&index, main[0], 3, 7);
        assert_eq!(index.most_work_tip().hash, side[2]);
        index.set_best_tip(&side[2]).expect("set");
        assert_eq!(index.best_height(), 4);
        assert!(index.is_on_best_chain(&main[0]));
        assert!(!index.is_on_best_chain(&main[1]));
        assert_eq!(index.at_height(2).map(|h| h.hash), Some(side[0]));
        assert_eq!(index.fork_point(&main[1], &side[2]).map(|h| h.hash), Some(main[0]));
        assert_eq!(index.ancestor(&main[1], 1).map(|h| h.hash), Some(main[0]));
    }

    #[test]
    fn median_time_past_uses_eleven_blocks() {
        let (index, genesis) = setup();
        let chain = extend(&index, genesis, 12, 0);
        // times are genesis + 60 * height; the window ends at height 12
        let expected = 1_000_000 + 60 * 7;
        assert_eq!(index.median_time_past(&chain[11]), Some(expected));
        assert_eq!(index.median_time_past(&genesis), Some(1_000_000));
    }
}
