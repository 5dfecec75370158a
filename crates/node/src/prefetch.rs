//! Background warming of the coin cache for blocks that are about to be
//! validated.
//!
//! Prefetching only hides latency. A block the worker never reached is
//! validated exactly the same way: the load-coinview rule fetches whatever
//! the cache is missing synchronously.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hybridd_chainstate::{CoinStore, ConsensusRuleEngine};
use hybridd_consensus::Hash256;
use hybridd_primitives::block::Block;
use lru::LruCache;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_RECENT_BLOCKS: usize = 1024;
const QUEUE_DEPTH: usize = 16;

#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    prefetched_blocks: AtomicU64,
    skipped_blocks: AtomicU64,
    dropped_batches: AtomicU64,
    fetched_ids: AtomicU64,
    fetch_us: AtomicU64,
    failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct PrefetchSnapshot {
    pub prefetched_blocks: u64,
    pub skipped_blocks: u64,
    pub dropped_batches: u64,
    pub fetched_ids: u64,
    pub fetch_us: u64,
    pub failures: u64,
}

impl PrefetchMetrics {
    fn record_fetch(&self, blocks: u64, ids: u64, elapsed: Duration) {
        self.prefetched_blocks.fetch_add(blocks, Ordering::Relaxed);
        self.fetched_ids.fetch_add(ids, Ordering::Relaxed);
        self.fetch_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PrefetchSnapshot {
        PrefetchSnapshot {
            prefetched_blocks: self.prefetched_blocks.load(Ordering::Relaxed),
            skipped_blocks: self.skipped_blocks.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            fetched_ids: self.fetched_ids.load(Ordering::Relaxed),
            fetch_us: self.fetch_us.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle used by the orchestrator to queue blocks for warming.
pub struct Prefetcher {
    sender: mpsc::Sender<Vec<Arc<Block>>>,
    metrics: Arc<PrefetchMetrics>,
}

impl Prefetcher {
    /// Starts the worker task. It exits when shutdown is signalled or every
    /// handle has been dropped.
    pub fn spawn(
        engine: Arc<ConsensusRuleEngine>,
        recent_blocks: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Vec<Arc<Block>>>(QUEUE_DEPTH);
        let metrics = Arc::new(PrefetchMetrics::default());
        let mut worker = Some(PrefetchWorker::new(
            engine,
            recent_blocks,
            Arc::clone(&metrics),
        ));

        let handle = tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    batch = receiver.recv() => batch,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                let Some(batch) = batch else {
                    break;
                };
                let Some(mut current) = worker.take() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || {
                    current.warm(&batch);
                    current
                })
                .await
                {
                    Ok(returned) => worker = Some(returned),
                    Err(err) => {
                        log_warn!("prefetch worker stopped: {err}");
                        break;
                    }
                }
            }
            log_debug!("Prefetch worker exiting");
        });

        (Self { sender, metrics }, handle)
    }

    /// Queues `blocks` without waiting; a full queue drops the batch.
    pub fn schedule(&self, blocks: Vec<Arc<Block>>) -> bool {
        if blocks.is_empty() {
            return false;
        }
        match self.sender.try_send(blocks) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.dropped_batches.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn metrics(&self) -> &Arc<PrefetchMetrics> {
        &self.metrics
    }
}

struct PrefetchWorker {
    engine: Arc<ConsensusRuleEngine>,
    recent: LruCache<Hash256, ()>,
    metrics: Arc<PrefetchMetrics>,
}

impl PrefetchWorker {
    fn new(
        engine: Arc<ConsensusRuleEngine>,
        recent_blocks: usize,
        metrics: Arc<PrefetchMetrics>,
    ) -> Self {
        let capacity = NonZeroUsize::new(recent_blocks).unwrap_or(NonZeroUsize::MIN);
        Self {
            engine,
            recent: LruCache::new(capacity),
            metrics,
        }
    }

    /// Fetches the coins of every block not seen recently in one batched
    /// call and returns how many blocks that covered.
    fn warm(&mut self, blocks: &[Arc<Block>]) -> usize {
        let mut ids = Vec::new();
        let mut warmed = 0usize;
        for block in blocks {
            let hash = block.hash();
            if self.recent.get(&hash).is_some() {
                self.metrics.skipped_blocks.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.recent.put(hash, ());
            ids.extend(self.engine.ids_to_fetch(block, true));
            warmed += 1;
        }
        if ids.is_empty() {
            return warmed;
        }

        let started = Instant::now();
        match self.engine.coins().fetch(&ids) {
            Ok(_) => {
                self.metrics
                    .record_fetch(warmed as u64, ids.len() as u64, started.elapsed());
            }
            Err(err) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                log_debug!("prefetch of {} ids failed: {err}", ids.len());
            }
        }
        warmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_chainstate::{EngineConfig, FixedTimeProvider, KvCoinStore, KvStakeStore};
    use hybridd_consensus::{consensus_params, CheckpointTable, Network};
    use hybridd_primitives::block::BlockHeader;
    use hybridd_primitives::outpoint::OutPoint;
    use hybridd_primitives::transaction::{Transaction, TxIn, TxOut};
    use hybridd_storage::memory::MemoryStore;

    fn engine() -> Arc<ConsensusRuleEngine> {
        let params = consensus_params(Network::PowRegtest);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedTimeProvider::new(u64::from(params.genesis.time)));
        Arc::new(
            ConsensusRuleEngine::initialize(
                params,
                CheckpointTable::disabled(),
                Arc::new(KvCoinStore::new(Arc::clone(&store))),
                Arc::new(KvStakeStore::new(store)),
                clock,
                EngineConfig::default(),
            )
            .expect("engine"),
        )
    }

    fn block(tag: u8) -> Arc<Block> {
        let spend = Transaction {
            version: 1,
            time: None,
            vin: vec![TxIn::new(OutPoint::new([tag; 32], 0), Vec::new(), u32::MAX)],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        Arc::new(Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0; 32],
                merkle_root: [0; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce: u32::from(tag),
            },
            transactions: vec![spend],
            signature: None,
        })
    }

    #[test]
    fn recent_blocks_are_not_fetched_twice() {
        let engine = engine();
        let metrics = Arc::new(PrefetchMetrics::default());
        let mut worker = PrefetchWorker::new(Arc::clone(&engine), 4, Arc::clone(&metrics));

        assert_eq!(worker.warm(&[block(1), block(2)]), 2);
        assert_eq!(worker.warm(&[block(1)]), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prefetched_blocks, 2);
        assert_eq!(snapshot.skipped_blocks, 1);
        assert_eq!(snapshot.fetched_ids, 4);
        assert!(engine.coins().stats().misses > 0);
    }

    #[test]
    fn evicted_blocks_are_fetched_again() {
        let metrics = Arc::new(PrefetchMetrics::default());
        let mut worker = PrefetchWorker::new(engine(), 1, Arc::clone(&metrics));
        assert_eq!(worker.warm(&[block(1)]), 1);
        assert_eq!(worker.warm(&[block(2)]), 1);
        assert_eq!(worker.warm(&[block(1)]), 1);
        assert_eq!(metrics.snapshot().skipped_blocks, 0);
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (prefetcher, handle) = Prefetcher::spawn(engine(), 8, shutdown_rx);
        assert!(prefetcher.schedule(vec![block(3)]));
        assert!(!prefetcher.schedule(Vec::new()));
        shutdown_tx.send(true).expect("signal");
        handle.await.expect("worker joins");
    }
}
