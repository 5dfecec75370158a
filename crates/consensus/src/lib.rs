//! Consensus constants, network parameters, subsidy schedule, and checkpoints.

pub mod checkpoints;
pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub type Hash256 = [u8; 32];

pub use checkpoints::{CheckpointError, CheckpointInfo, CheckpointTable};
pub use params::{
    consensus_params, hash256_from_hex, hash256_to_hex, ConsensusParams, Deployments,
    GenesisParams, HexError, Network, NetworkKind, SubsidyParams,
};
pub use rewards::{proof_of_stake_reward, proof_of_work_subsidy};
