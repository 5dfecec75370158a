//! The consensus manager: pulls blocks, runs them through the rule engine,
//! advances the tip and applies the failure policy.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use hybridd_chainstate::{
    ChainedHeader, ConsensusError, ConsensusRuleEngine, EngineError, ErrorCode, FailurePolicy,
    IndexError, ValidationContext,
};
use hybridd_consensus::hash256_to_hex;
use hybridd_primitives::block::Block;
use tokio::sync::watch;

use crate::peers::{EventSink, InvalidBlockStore, PeerSink};
use crate::prefetch::Prefetcher;
use crate::source::{BlockSource, Pulled};

/// Pause before a deferred block is delivered again.
pub const DEFERRED_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug)]
pub struct ManagerConfig {
    pub ban_time: u64,
    /// Seconds a rejected block stays invalid when the error sets no window.
    pub invalid_block_window: u64,
    pub prefetch_lookahead: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ban_time: crate::config::DEFAULT_BAN_TIME_SECS,
            invalid_block_window: crate::config::DEFAULT_INVALID_BLOCK_WINDOW_SECS,
            prefetch_lookahead: crate::config::DEFAULT_PREFETCH_LOOKAHEAD,
        }
    }
}

#[derive(Debug)]
pub enum NodeError {
    Engine(EngineError),
    Consensus(ConsensusError),
    Index(IndexError),
    /// The coin view's tip is not in the header index.
    UnknownCoinTip(String),
    Task(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Engine(err) => write!(f, "{err}"),
            NodeError::Consensus(err) => write!(f, "{err}"),
            NodeError::Index(err) => write!(f, "{err}"),
            NodeError::UnknownCoinTip(hash) => {
                write!(f, "coin view tip {hash} is not in the header index")
            }
            NodeError::Task(message) => write!(f, "task failed: {message}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<EngineError> for NodeError {
    fn from(err: EngineError) -> Self {
        NodeError::Engine(err)
    }
}

impl From<ConsensusError> for NodeError {
    fn from(err: ConsensusError) -> Self {
        NodeError::Consensus(err)
    }
}

impl From<IndexError> for NodeError {
    fn from(err: IndexError) -> Self {
        NodeError::Index(err)
    }
}

impl From<tokio::task::JoinError> for NodeError {
    fn from(err: tokio::task::JoinError) -> Self {
        NodeError::Task(err.to_string())
    }
}

#[derive(Debug, Default)]
pub struct ManagerMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    rewinds: AtomicU64,
    rewound_blocks: AtomicU64,
    bans: AtomicU64,
    capability_requests: AtomicU64,
    deferred: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct ManagerSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub rewinds: u64,
    pub rewound_blocks: u64,
    pub bans: u64,
    pub capability_requests: u64,
    pub deferred: u64,
}

impl ManagerMetrics {
    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            rewinds: self.rewinds.load(Ordering::Relaxed),
            rewound_blocks: self.rewound_blocks.load(Ordering::Relaxed),
            bans: self.bans.load(Ordering::Relaxed),
            capability_requests: self.capability_requests.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

pub struct ConsensusManager {
    engine: Arc<ConsensusRuleEngine>,
    source: Arc<dyn BlockSource>,
    peers: Arc<dyn PeerSink>,
    events: Arc<dyn EventSink>,
    invalid: InvalidBlockStore,
    config: ManagerConfig,
    /// Serializes block acceptance and rewind.
    write_lock: Mutex<()>,
    tip: RwLock<Arc<ChainedHeader>>,
    metrics: ManagerMetrics,
    prefetcher: Mutex<Option<Prefetcher>>,
}

impl ConsensusManager {
    pub fn new(
        engine: Arc<ConsensusRuleEngine>,
        source: Arc<dyn BlockSource>,
        peers: Arc<dyn PeerSink>,
        events: Arc<dyn EventSink>,
        config: ManagerConfig,
    ) -> Result<Self, NodeError> {
        let coin_tip = engine.coin_tip()?;
        let tip = engine
            .chain()
            .get(&coin_tip.hash)
            .ok_or_else(|| NodeError::UnknownCoinTip(hash256_to_hex(&coin_tip.hash)))?;
        source.set_cursor(tip.height + 1);
        log_info!(
            "Consensus manager starting at {} (height {})",
            hash256_to_hex(&tip.hash),
            tip.height
        );
        Ok(Self {
            engine,
            source,
            peers,
            events,
            invalid: InvalidBlockStore::new(),
            config,
            write_lock: Mutex::new(()),
            tip: RwLock::new(tip),
            metrics: ManagerMetrics::default(),
            prefetcher: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<ConsensusRuleEngine> {
        &self.engine
    }

    pub fn tip(&self) -> Arc<ChainedHeader> {
        match self.tip.read() {
            Ok(tip) => Arc::clone(&tip),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    pub fn invalid_blocks(&self) -> &InvalidBlockStore {
        &self.invalid
    }

    pub fn prefetch_metrics(&self) -> Option<Arc<crate::prefetch::PrefetchMetrics>> {
        self.prefetcher_slot()
            .as_ref()
            .map(|prefetcher| Arc::clone(prefetcher.metrics()))
    }

    pub fn set_prefetcher(&self, prefetcher: Prefetcher) {
        *self.prefetcher_slot() = Some(prefetcher);
    }

    fn prefetcher_slot(&self) -> MutexGuard<'_, Option<Prefetcher>> {
        self.prefetcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_tip(&self, header: Arc<ChainedHeader>) {
        match self.tip.write() {
            Ok(mut tip) => *tip = header,
            Err(poisoned) => *poisoned.into_inner() = header,
        }
    }

    fn now(&self) -> u64 {
        self.engine.services().time.adjusted_time()
    }

    /// Validates and connects one block. On failure the error is recorded on
    /// `context` and the failure policy has already been applied.
    pub fn accept_block(
        &self,
        context: &mut ValidationContext,
    ) -> Result<Arc<ChainedHeader>, ConsensusError> {
        let _guard = self.lock_writes();
        let hash = context.block_hash();

        if let Some(err) = self.marked_invalid(context) {
            context.error = Some(err.clone());
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            log_warn!("Block {} rejected: {err}", hash256_to_hex(&hash));
            return Err(err);
        }

        match self.engine.full_validation(context) {
            Ok(()) => self.connected(context),
            Err(err) => {
                self.apply_failure_policy(context, &err);
                Err(err)
            }
        }
    }

    fn marked_invalid(&self, context: &ValidationContext) -> Option<ConsensusError> {
        let now = self.now();
        let hash = context.block_hash();
        if self.invalid.is_invalid(&hash, now) {
            return Some(ConsensusError::new(ErrorCode::BlockMarkedInvalid));
        }
        let parent = context.block.header.prev_block;
        if self.invalid.is_invalid(&parent, now) {
            return Some(
                ConsensusError::new(ErrorCode::BlockMarkedInvalid).with_message(format!(
                    "descends from invalid block {}",
                    hash256_to_hex(&parent)
                )),
            );
        }
        None
    }

    fn connected(&self, context: &ValidationContext) -> Result<Arc<ChainedHeader>, ConsensusError> {
        let header = context
            .chained_header
            .clone()
            .ok_or_else(|| ConsensusError::store_failure("accepted block has no header"))?;
        let chain = self.engine.chain();
        if header.chain_work > chain.best_tip().chain_work {
            chain.set_best_tip(&header.hash)?;
        }
        self.set_tip(Arc::clone(&header));
        self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        self.events.on_block_accepted(&context.block, &header);

        // While catching up the cache writes back on its own threshold.
        let syncing = self.engine.is_initial_block_download();
        let force = !syncing && chain.most_work_tip().hash == header.hash;
        if let Err(err) = self.engine.flush(force) {
            log_error!(
                "Flush after {} failed: {err}",
                hash256_to_hex(&header.hash)
            );
        }
        if syncing {
            log_debug!(
                "Accepted block {} at height {}",
                hash256_to_hex(&header.hash),
                header.height
            );
        } else {
            log_info!(
                "Accepted block {} at height {}",
                hash256_to_hex(&header.hash),
                header.height
            );
        }
        Ok(header)
    }

    fn apply_failure_policy(&self, context: &mut ValidationContext, err: &ConsensusError) {
        let hash = context.block_hash();
        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        log_warn!("Block {} rejected: {err}", hash256_to_hex(&hash));

        match err.policy() {
            FailurePolicy::Rewind => match self.rewind_locked() {
                Ok((tip, rewound)) => {
                    if rewound > 0 {
                        self.source.set_cursor(tip.height + 1);
                    }
                }
                Err(rewind_err) => {
                    log_error!("Rewind after {} failed: {rewind_err}", hash256_to_hex(&hash));
                }
            },
            FailurePolicy::RequestCapability(capability) => {
                self.metrics
                    .capability_requests
                    .fetch_add(1, Ordering::Relaxed);
                self.peers.request_capability(capability, context.peer);
            }
            FailurePolicy::Defer => {
                self.metrics.deferred.fetch_add(1, Ordering::Relaxed);
                self.source.set_cursor(self.tip().height + 1);
            }
            FailurePolicy::Reject => {
                let tip = self.tip();
                if let Err(index_err) = self.engine.chain().set_best_tip(&tip.hash) {
                    log_error!("Failed to reset header tip: {index_err}");
                }
                let until = err
                    .reject_until
                    .unwrap_or_else(|| self.now().saturating_add(self.config.invalid_block_window));
                self.invalid.mark(hash, until);
                context.reject_until = Some(until);

                if let (Some(peer), false) = (context.peer, err.no_ban) {
                    context.ban_duration = Some(self.config.ban_time);
                    self.metrics.bans.fetch_add(1, Ordering::Relaxed);
                    self.peers.ban(peer, self.config.ban_time, &err.to_string());
                }
            }
        }
    }

    /// Rolls the coin view back until its tip is on the best header chain and
    /// points the tip and the block source at it.
    pub fn rewind(&self) -> Result<Arc<ChainedHeader>, NodeError> {
        let _guard = self.lock_writes();
        let (tip, _) = self.rewind_locked()?;
        self.source.set_cursor(tip.height + 1);
        Ok(tip)
    }

    fn rewind_locked(&self) -> Result<(Arc<ChainedHeader>, u64), NodeError> {
        let chain = self.engine.chain();
        let mut rewound = 0u64;
        let mut coin_tip = self.engine.coin_tip()?;
        while !chain.is_on_best_chain(&coin_tip.hash) {
            coin_tip = self.engine.rewind()?;
            rewound += 1;
        }
        let tip = chain
            .get(&coin_tip.hash)
            .ok_or_else(|| NodeError::UnknownCoinTip(hash256_to_hex(&coin_tip.hash)))?;
        self.engine.flush(true)?;
        self.set_tip(Arc::clone(&tip));

        self.metrics.rewinds.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .rewound_blocks
            .fetch_add(rewound, Ordering::Relaxed);
        if rewound > 0 {
            log_info!(
                "Rewound {rewound} block(s) to {} at height {}",
                hash256_to_hex(&tip.hash),
                tip.height
            );
        }
        Ok((tip, rewound))
    }

    fn schedule_prefetch(&self, block: &Arc<Block>) {
        let slot = self.prefetcher_slot();
        let Some(prefetcher) = slot.as_ref() else {
            return;
        };
        let mut blocks = vec![Arc::clone(block)];
        let lookahead = self.config.prefetch_lookahead;
        let distance = self
            .engine
            .chain()
            .most_work_tip()
            .height
            .saturating_sub(self.tip().height);
        if lookahead > 0 && distance as usize > lookahead {
            blocks.extend(self.source.lookahead(lookahead));
        }
        prefetcher.schedule(blocks);
    }

    /// Pulls and processes blocks until shutdown, then flushes the coin view.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
        let arrival = self.source.arrival();
        loop {
            if *shutdown.borrow() {
                log_info!("Shutdown requested; stopping consensus loop.");
                break;
            }
            let Some(item) = self.source.try_next() else {
                tokio::select! {
                    _ = arrival.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            match item {
                Pulled::Reorg => {
                    let manager = Arc::clone(&self);
                    if let Err(err) = tokio::task::spawn_blocking(move || manager.rewind()).await? {
                        log_error!("Rewind failed: {err}");
                    }
                }
                Pulled::Block { block, peer } => {
                    self.schedule_prefetch(&block);
                    let manager = Arc::clone(&self);
                    let deferred = tokio::task::spawn_blocking(move || {
                        let mut context = ValidationContext::new(block, peer);
                        // Rejections were logged and handled inside.
                        matches!(
                            manager.accept_block(&mut context),
                            Err(err) if err.policy() == FailurePolicy::Defer
                        )
                    })
                    .await?;
                    if deferred {
                        tokio::select! {
                            _ = tokio::time::sleep(DEFERRED_RETRY_DELAY) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.flush(true)).await??;
        Ok(())
    }
}
