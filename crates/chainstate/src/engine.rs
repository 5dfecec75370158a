//! The consensus rule engine: shared services plus the network's rule set.

use std::fmt;
use std::sync::Arc;

use hybridd_consensus::{hash256_to_hex, CheckpointInfo, CheckpointTable, ConsensusParams, Hash256};
use hybridd_primitives::block::Block;

use crate::cache::{CachedCoinView, CoinCacheConfig};
use crate::coins::{CoinStore, CoinTip, CoinViewError};
use crate::context::{RuleContext, ValidationContext};
use crate::errors::{ConsensusError, ErrorCode};
use crate::genesis::genesis_block;
use crate::ibd::{InitialBlockDownloadState, TimeProvider};
use crate::index::{ChainIndexer, ChainedHeader, IndexError};
use crate::metrics::ValidationMetrics;
use crate::rules::{ids_to_fetch, RulePhase, RuleSet};
use crate::stake::{BlockStake, StakeChainStore, StakeError, StakeItem, StakeStore};
use crate::validator::BlockValidator;

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub coin_cache: CoinCacheConfig,
    pub stake_cache_max: usize,
    pub max_tip_age: u64,
    /// Script verification threads; 0 uses the global rayon pool.
    pub script_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coin_cache: CoinCacheConfig::default(),
            stake_cache_max: 10_000,
            max_tip_age: 24 * 60 * 60,
            script_threads: 0,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Index(IndexError),
    Coins(CoinViewError),
    Stake(StakeError),
    ThreadPool(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Index(err) => write!(f, "chain index: {err}"),
            EngineError::Coins(err) => write!(f, "coin view: {err}"),
            EngineError::Stake(err) => write!(f, "stake store: {err}"),
            EngineError::ThreadPool(message) => write!(f, "script thread pool: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<IndexError> for EngineError {
    fn from(err: IndexError) -> Self {
        EngineError::Index(err)
    }
}

impl From<CoinViewError> for EngineError {
    fn from(err: CoinViewError) -> Self {
        EngineError::Coins(err)
    }
}

impl From<StakeError> for EngineError {
    fn from(err: StakeError) -> Self {
        EngineError::Stake(err)
    }
}

/// Everything a rule may consult or mutate.
pub struct ChainServices {
    pub params: Arc<ConsensusParams>,
    pub checkpoints: Arc<CheckpointTable>,
    pub chain: Arc<ChainIndexer>,
    pub coins: Arc<CachedCoinView>,
    pub stakes: Arc<StakeChainStore>,
    pub ibd: Arc<InitialBlockDownloadState>,
    pub time: Arc<dyn TimeProvider>,
    pub metrics: Arc<ValidationMetrics>,
    pub script_pool: Option<Arc<rayon::ThreadPool>>,
}

pub struct ConsensusRuleEngine {
    services: ChainServices,
    rules: RuleSet,
    validator: BlockValidator,
}

impl ConsensusRuleEngine {
    /// Builds the genesis block, seeds an empty coin store and the stake
    /// chain with it, and wraps the coin store in the write-back cache.
    pub fn initialize(
        params: ConsensusParams,
        checkpoints: CheckpointTable,
        coin_store: Arc<dyn CoinStore>,
        stake_store: Arc<dyn StakeStore>,
        time: Arc<dyn TimeProvider>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let genesis = genesis_block(&params);
        let genesis_hash = genesis.hash();

        let chain = Arc::new(ChainIndexer::new(
            genesis.header.clone(),
            genesis.is_proof_of_stake(),
        )?);
        let coin_tip = coin_store.initialize(&genesis_hash)?;
        let coins = Arc::new(CachedCoinView::new(coin_store, config.coin_cache)?);
        let stakes = Arc::new(StakeChainStore::new(
            stake_store,
            genesis_hash,
            config.stake_cache_max,
        ));
        let ibd = Arc::new(InitialBlockDownloadState::new(
            &params,
            &checkpoints,
            config.max_tip_age,
        ));

        let script_pool = if config.script_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.script_threads)
                .thread_name(|index| format!("script-{index}"))
                .build()
                .map_err(|err| EngineError::ThreadPool(err.to_string()))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        hybridd_log::log_info!(
            "consensus engine on {} (genesis {}, coin tip {} at height {})",
            params.network.name(),
            hash256_to_hex(&genesis_hash),
            hash256_to_hex(&coin_tip.hash),
            coin_tip.height
        );

        let validator = BlockValidator::for_kind(params.kind);
        let rules = RuleSet::for_network(params.kind);
        Ok(Self {
            services: ChainServices {
                params: Arc::new(params),
                checkpoints: Arc::new(checkpoints),
                chain,
                coins,
                stakes,
                ibd,
                time,
                metrics: Arc::new(ValidationMetrics::default()),
                script_pool,
            },
            rules,
            validator,
        })
    }

    pub fn services(&self) -> &ChainServices {
        &self.services
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.services.params
    }

    pub fn chain(&self) -> &Arc<ChainIndexer> {
        &self.services.chain
    }

    pub fn coins(&self) -> &Arc<CachedCoinView> {
        &self.services.coins
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut RuleSet {
        &mut self.rules
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.services.chain.genesis().hash
    }

    /// Indexes the header if needed and builds the rule context against its
    /// parent.
    fn prepare(&self, context: &mut ValidationContext) -> Result<(), ConsensusError> {
        let chain = &self.services.chain;
        let header = match context.chained_header.clone() {
            Some(header) => header,
            None => {
                let header = chain.add_header(
                    context.block.header.clone(),
                    context.block.is_proof_of_stake(),
                )?;
                context.chained_header = Some(Arc::clone(&header));
                header
            }
        };
        let prev = header
            .prev
            .and_then(|prev| chain.get(&prev))
            .ok_or_else(|| {
                ConsensusError::new(ErrorCode::PrevBlockNotFound).with_message(format!(
                    "parent of {} not indexed",
                    hash256_to_hex(&header.hash)
                ))
            })?;
        let prev_median_time_past = chain
            .median_time_past(&prev.hash)
            .unwrap_or(prev.header.time);

        context.rule_context = Some(RuleContext::new(
            Arc::clone(&context.block),
            header,
            prev,
            prev_median_time_past,
            self.services.time.adjusted_time(),
            self.validator,
        ));
        Ok(())
    }

    fn run_phases(
        &self,
        context: &mut ValidationContext,
        phases: &[RulePhase],
        skip_rules: &[&str],
    ) -> Result<(), ConsensusError> {
        if context.rule_context.is_none() {
            self.prepare(context)?;
        }
        let Some(rule_context) = context.rule_context.as_mut() else {
            return Err(ConsensusError::store_failure("rule context missing"));
        };
        for phase in phases {
            self.rules
                .execute(*phase, rule_context, &self.services, skip_rules)?;
        }
        Ok(())
    }

    fn record_outcome(context: &mut ValidationContext, result: Result<(), ConsensusError>) -> Result<(), ConsensusError> {
        if let Err(err) = &result {
            context.reject_until = err.reject_until;
            context.error = Some(err.clone());
        }
        result
    }

    /// Header, integrity and partial checks: everything that needs no coins.
    pub fn validate_block(
        &self,
        context: &mut ValidationContext,
        skip_rules: &[&str],
    ) -> Result<(), ConsensusError> {
        let result = self.run_phases(
            context,
            &[RulePhase::Header, RulePhase::Integrity, RulePhase::Partial],
            skip_rules,
        );
        Self::record_outcome(context, result)
    }

    /// Every phase, ending with the coin view saved at the block.
    pub fn full_validation(&self, context: &mut ValidationContext) -> Result<(), ConsensusError> {
        let result = self.run_phases(context, &RulePhase::ALL, &[]);
        if result.is_ok() {
            let skipped = context
                .rule_context
                .as_ref()
                .is_some_and(|rule_context| rule_context.skip_validation);
            self.services.metrics.record_block(skipped);
        }
        Self::record_outcome(context, result)
    }

    pub fn ids_to_fetch(&self, block: &Block, enforce_bip30: bool) -> Vec<Hash256> {
        ids_to_fetch(block, enforce_bip30)
    }

    pub fn get_stake(&self, block_hash: &Hash256) -> Result<Option<StakeItem>, ConsensusError> {
        Ok(self.services.stakes.get_item(block_hash)?)
    }

    pub fn set_stake(&self, header: &ChainedHeader, stake: BlockStake) -> Result<(), ConsensusError> {
        Ok(self.services.stakes.set(header.hash, header.height, stake)?)
    }

    /// Writes back the coin cache (when forced or above its threshold) and
    /// the stake working set.
    pub fn flush(&self, force: bool) -> Result<(), ConsensusError> {
        let wrote = self.services.coins.flush(force)?;
        // a coin write-back moves the persisted tip, so the stake records up
        // to it go out with it
        let stakes = self.services.stakes.flush(force || wrote)?;
        if wrote || stakes > 0 {
            let tip = self.services.coins.persisted_tip()?;
            hybridd_log::log_debug!(
                "flushed coin view at {} (height {}), {} stake items",
                hash256_to_hex(&tip.hash),
                tip.height,
                stakes
            );
        }
        Ok(())
    }

    /// Undoes the coin view's latest block.
    pub fn rewind(&self) -> Result<CoinTip, ConsensusError> {
        Ok(self.services.coins.rewind()?)
    }

    pub fn coin_tip(&self) -> Result<CoinTip, ConsensusError> {
        Ok(self.services.coins.tip()?)
    }

    pub fn is_initial_block_download(&self) -> bool {
        let tip = self
            .services
            .coins
            .current_tip_hash()
            .ok()
            .and_then(|hash| self.services.chain.get(&hash));
        self.services
            .ibd
            .is_initial_block_download(tip.as_deref(), self.services.time.as_ref())
    }

    pub fn last_checkpoint_height(&self) -> u32 {
        self.services.checkpoints.last_checkpoint_height()
    }

    pub fn checkpoint(&self, height: u32) -> Option<CheckpointInfo> {
        self.services.checkpoints.checkpoint(height).cloned()
    }
}
