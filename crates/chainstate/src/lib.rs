//! Consensus validation: coin view, stake chain, chain index and the rule engine.

pub mod cache;
pub mod coins;
pub mod context;
pub mod engine;
pub mod errors;
pub mod genesis;
pub mod ibd;
pub mod index;
pub mod merkle;
pub mod metrics;
pub mod rules;
pub mod stake;
pub mod utxo;
pub mod validator;
pub mod view;

pub use cache::{CachedCoinView, CoinCacheConfig, CoinCacheStats};
pub use coins::{CoinStore, CoinTip, CoinViewError, KvCoinStore, RewindData};
pub use context::{DeploymentFlags, PeerId, RuleContext, ValidationContext};
pub use engine::{ChainServices, ConsensusRuleEngine, EngineConfig, EngineError};
pub use errors::{Capability, ConsensusError, ErrorCode, FailurePolicy};
pub use ibd::{FixedTimeProvider, InitialBlockDownloadState, SystemTimeProvider, TimeProvider};
pub use index::{ChainIndexer, ChainedHeader, IndexError};
pub use rules::{ConsensusRule, FnRule, RulePhase, RuleSet};
pub use stake::{BlockStake, KvStakeStore, StakeChainStore, StakeError, StakeItem, StakeStore};
pub use validator::BlockValidator;
