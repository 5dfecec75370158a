//! Write-back cache in front of the persistent coin store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use hybridd_consensus::Hash256;

use crate::coins::{CoinStore, CoinTip, CoinViewError, RewindData};
use crate::utxo::UnspentOutputs;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoinCacheConfig {
    /// Dirty entries above which a non-forced flush writes back.
    pub flush_threshold: usize,
    /// Entries kept after a flush; the oldest clean entries go first.
    pub max_entries: usize,
}

impl Default for CoinCacheConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 20_000,
            max_entries: 200_000,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    coins: Option<UnspentOutputs>,
    dirty: bool,
    /// Tip height when the entry was last written or loaded.
    generation: u32,
}

struct CacheState {
    entries: HashMap<Hash256, CacheEntry>,
    tip: CoinTip,
    persisted_tip: CoinTip,
    rewind: BTreeMap<u32, RewindData>,
    dirty: usize,
    /// Bumped whenever the backing store changes under the entries. A read
    /// that started in an older epoch may be stale.
    epoch: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CoinCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
    pub entries: usize,
    pub dirty: usize,
    pub pending_rewind: usize,
}

/// Read-through, write-back [`CoinStore`]. Misses are read from the backing
/// store without holding the cache lock; a read that overlaps a flush or a
/// store rewind is thrown away and repeated.
pub struct CachedCoinView {
    inner: Arc<dyn CoinStore>,
    config: CoinCacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    flushes: AtomicU64,
}

impl CachedCoinView {
    pub fn new(inner: Arc<dyn CoinStore>, config: CoinCacheConfig) -> Result<Self, CoinViewError> {
        let tip = inner.tip()?;
        Ok(Self {
            inner,
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tip,
                persisted_tip: tip,
                rewind: BTreeMap::new(),
                dirty: 0,
                epoch: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CoinViewError> {
        self.state.lock().map_err(|_| CoinViewError::Poisoned)
    }

    pub fn inner(&self) -> &Arc<dyn CoinStore> {
        &self.inner
    }

    pub fn stats(&self) -> CoinCacheStats {
        let (entries, dirty, pending_rewind) = match self.state.lock() {
            Ok(state) => (state.entries.len(), state.dirty, state.rewind.len()),
            Err(_) => (0, 0, 0),
        };
        CoinCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            entries,
            dirty,
            pending_rewind,
        }
    }

    pub fn persisted_tip(&self) -> Result<CoinTip, CoinViewError> {
        Ok(self.lock()?.persisted_tip)
    }

    /// Writes dirty entries back when forced or above the threshold.
    /// Returns whether anything was written.
    pub fn flush(&self, force: bool) -> Result<bool, CoinViewError> {
        let mut state = self.lock()?;
        if !force && state.dirty <= self.config.flush_threshold {
            return Ok(false);
        }
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut CacheState) -> Result<bool, CoinViewError> {
        if state.dirty == 0 && state.rewind.is_empty() && state.tip == state.persisted_tip {
            return Ok(false);
        }

        let started = Instant::now();
        let mut outputs = Vec::with_capacity(state.dirty);
        for (txid, entry) in state.entries.iter().filter(|(_, entry)| entry.dirty) {
            outputs.push(
                entry
                    .coins
                    .clone()
                    .unwrap_or_else(|| UnspentOutputs::pruned(*txid)),
            );
        }
        let rewind: Vec<RewindData> = state.rewind.values().cloned().collect();
        self.inner
            .save(&outputs, &rewind, &state.persisted_tip.hash, state.tip)?;

        for entry in state.entries.values_mut() {
            entry.dirty = false;
        }
        state
            .entries
            .retain(|_, entry| entry.coins.as_ref().is_some_and(|c| !c.is_fully_spent()));
        state.rewind.clear();
        state.dirty = 0;
        state.persisted_tip = state.tip;
        state.epoch += 1;
        self.evict_locked(state);
        self.flushes.fetch_add(1, Ordering::Relaxed);

        hybridd_log::log_debug!(
            "coin cache flushed {} records at height {} in {}ms",
            outputs.len(),
            state.tip.height,
            started.elapsed().as_millis()
        );
        Ok(true)
    }

    fn evict_locked(&self, state: &mut CacheState) {
        if state.entries.len() <= self.config.max_entries {
            return;
        }
        let excess = state.entries.len() - self.config.max_entries;
        let mut clean: Vec<(u32, Hash256)> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.dirty)
            .map(|(txid, entry)| (entry.generation, *txid))
            .collect();
        clean.sort_unstable();
        for (_, txid) in clean.into_iter().take(excess) {
            state.entries.remove(&txid);
        }
    }

    fn write_entry(state: &mut CacheState, coins: Option<UnspentOutputs>, txid: Hash256) {
        let generation = state.tip.height;
        let previous = state.entries.insert(
            txid,
            CacheEntry {
                coins,
                dirty: true,
                generation,
            },
        );
        if !previous.is_some_and(|entry| entry.dirty) {
            state.dirty += 1;
        }
    }

    fn collect(state: &CacheState, ids: &[Hash256]) -> Vec<Option<UnspentOutputs>> {
        ids.iter()
            .map(|id| {
                state
                    .entries
                    .get(id)
                    .and_then(|entry| entry.coins.clone())
                    .filter(|coins| !coins.is_fully_spent())
            })
            .collect()
    }
}

impl CoinStore for CachedCoinView {
    fn fetch(&self, ids: &[Hash256]) -> Result<Vec<Option<UnspentOutputs>>, CoinViewError> {
        loop {
            let (missing, epoch) = {
                let state = self.lock()?;
                let missing: Vec<Hash256> = ids
                    .iter()
                    .filter(|id| !state.entries.contains_key(*id))
                    .copied()
                    .collect();
                self.hits
                    .fetch_add((ids.len() - missing.len()) as u64, Ordering::Relaxed);
                if missing.is_empty() {
                    return Ok(Self::collect(&state, ids));
                }
                (missing, state.epoch)
            };

            self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);
            let fetched = self.inner.fetch(&missing)?;

            let mut state = self.lock()?;
            if state.epoch != epoch {
                continue;
            }
            let generation = state.tip.height;
            for (txid, coins) in missing.into_iter().zip(fetched) {
                // entries written while the read was in flight are newer
                state.entries.entry(txid).or_insert(CacheEntry {
                    coins,
                    dirty: false,
                    generation,
                });
            }
            return Ok(Self::collect(&state, ids));
        }
    }

    fn tip(&self) -> Result<CoinTip, CoinViewError> {
        Ok(self.lock()?.tip)
    }

    fn save(
        &self,
        outputs: &[UnspentOutputs],
        rewind: &[RewindData],
        previous_tip: &Hash256,
        new_tip: CoinTip,
    ) -> Result<(), CoinViewError> {
        let mut state = self.lock()?;
        if state.tip.hash != *previous_tip {
            return Err(CoinViewError::TipMismatch {
                expected: *previous_tip,
                found: state.tip.hash,
            });
        }
        state.tip = new_tip;
        for record in outputs {
            Self::write_entry(&mut state, Some(record.clone()), record.txid);
        }
        for data in rewind {
            state.rewind.insert(data.height, data.clone());
        }
        Ok(())
    }

    /// Undoes the latest block from pending rewind data when it is still in
    /// memory, otherwise flushes and lets the backing store rewind.
    fn rewind(&self) -> Result<CoinTip, CoinViewError> {
        let mut state = self.lock()?;
        let height = state.tip.height;
        if let Some(data) = state.rewind.remove(&height) {
            for txid in &data.remove {
                Self::write_entry(&mut state, None, *txid);
            }
            for record in &data.restore {
                Self::write_entry(&mut state, Some(record.clone()), record.txid);
            }
            state.tip = CoinTip {
                hash: data.previous_tip,
                height: height.saturating_sub(1),
            };
            return Ok(state.tip);
        }

        self.flush_locked(&mut state)?;
        let restored = self.inner.rewind()?;
        state.entries.clear();
        state.dirty = 0;
        state.epoch += 1;
        state.tip = restored;
        state.persisted_tip = restored;
        Ok(restored)
    }

    fn initialize(&self, genesis: &Hash256) -> Result<CoinTip, CoinViewError> {
        let mut state = self.lock()?;
        let tip = self.inner.initialize(genesis)?;
        state.tip = tip;
        state.persisted_tip = tip;
        state.epoch += 1;
        Ok(tip)
    }
}
