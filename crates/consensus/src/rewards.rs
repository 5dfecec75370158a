//! Block subsidy schedule.

use crate::money::Amount;
use crate::params::ConsensusParams;

/// Proof-of-work subsidy at `height`, excluding fees.
pub fn proof_of_work_subsidy(height: u32, params: &ConsensusParams) -> Amount {
    let subsidy = &params.subsidy;
    if subsidy.premine_height == Some(height) {
        return subsidy.premine_reward;
    }

    let Some(interval) = subsidy.halving_interval.filter(|interval| *interval > 0) else {
        return subsidy.initial_subsidy;
    };
    let halvings = height / interval;
    // Shifting an i64 by 64 or more is undefined in the reward register.
    if halvings >= 64 {
        return 0;
    }
    subsidy.initial_subsidy >> halvings
}

/// Proof-of-stake reward at `height`, excluding fees.
pub fn proof_of_stake_reward(height: u32, params: &ConsensusParams) -> Amount {
    let subsidy = &params.subsidy;
    if subsidy.premine_height == Some(height) {
        return subsidy.premine_reward;
    }
    subsidy.pos_reward
}
