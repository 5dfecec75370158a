//! Per-block validation state.

use std::sync::Arc;

use hybridd_consensus::money::Amount;
use hybridd_consensus::{ConsensusParams, Hash256};
use hybridd_primitives::block::Block;
use hybridd_script::interpreter::{
    ScriptFlags, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY,
    SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_NULLDUMMY, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS,
};

use crate::errors::ConsensusError;
use crate::index::ChainedHeader;
use crate::stake::BlockStake;
use crate::validator::BlockValidator;
use crate::view::UnspentOutputSet;

pub type PeerId = u64;

/// One candidate block on its way through the rule chain.
#[derive(Debug)]
pub struct ValidationContext {
    pub block: Arc<Block>,
    pub chained_header: Option<Arc<ChainedHeader>>,
    /// The peer that sent the block; `None` when produced locally.
    pub peer: Option<PeerId>,
    pub error: Option<ConsensusError>,
    pub reject_until: Option<u64>,
    pub ban_duration: Option<u64>,
    pub rule_context: Option<RuleContext>,
}

impl ValidationContext {
    pub fn new(block: Arc<Block>, peer: Option<PeerId>) -> Self {
        Self {
            block,
            chained_header: None,
            peer,
            error: None,
            reject_until: None,
            ban_duration: None,
            rule_context: None,
        }
    }

    pub fn block_hash(&self) -> Hash256 {
        self.chained_header
            .as_ref()
            .map(|header| header.hash)
            .unwrap_or_else(|| self.block.hash())
    }
}

/// Soft-fork rules in force at one height.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeploymentFlags {
    pub script_flags: ScriptFlags,
    pub enforce_bip34: bool,
    pub enforce_bip30: bool,
    /// Locktime compares against median-time-past instead of block time.
    pub locktime_median_time_past: bool,
    pub enforce_sequence_locks: bool,
    pub segwit: bool,
    pub minimum_version: i32,
}

impl DeploymentFlags {
    pub fn at_height(params: &ConsensusParams, height: u32, block_hash: &Hash256) -> Self {
        let deployments = &params.deployments;
        let mut script_flags = SCRIPT_VERIFY_P2SH;
        let mut minimum_version = 1;
        let enforce_bip34 = height >= deployments.bip34_height;
        if enforce_bip34 {
            minimum_version = 2;
        }
        if height >= deployments.bip66_height {
            script_flags |= SCRIPT_VERIFY_DERSIG;
            minimum_version = 3;
        }
        if height >= deployments.bip65_height {
            script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
            minimum_version = 4;
        }
        let csv = height >= deployments.csv_height;
        if csv {
            script_flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
        }
        let segwit = height >= deployments.segwit_height;
        if segwit {
            script_flags |= SCRIPT_VERIFY_WITNESS | SCRIPT_VERIFY_NULLDUMMY;
        }
        Self {
            script_flags,
            enforce_bip34,
            enforce_bip30: !params.is_bip30_exception(height, block_hash),
            locktime_median_time_past: csv,
            enforce_sequence_locks: csv,
            segwit,
            minimum_version,
        }
    }
}

/// Stake data resolved while validating a block on a stake network.
#[derive(Clone, Debug, Default)]
pub struct StakeRuleState {
    pub block_stake: BlockStake,
    pub coinstake_value_in: Option<Amount>,
}

/// Scratch state for one validation attempt.
#[derive(Debug)]
pub struct RuleContext {
    pub block: Arc<Block>,
    pub hash: Hash256,
    pub height: u32,
    pub header: Arc<ChainedHeader>,
    pub prev: Arc<ChainedHeader>,
    pub prev_median_time_past: u32,
    pub adjusted_time: u64,
    pub flags: DeploymentFlags,
    /// Set at or below a checkpoint or the assume-valid block; bypasses the
    /// expensive parts of full validation.
    pub skip_validation: bool,
    /// Transaction ids in block order, filled by the merkle rule.
    pub txids: Vec<Hash256>,
    pub coins: Option<UnspentOutputSet>,
    pub stake: Option<StakeRuleState>,
    pub fees: Amount,
    pub validator: BlockValidator,
}

impl RuleContext {
    pub fn new(
        block: Arc<Block>,
        header: Arc<ChainedHeader>,
        prev: Arc<ChainedHeader>,
        prev_median_time_past: u32,
        adjusted_time: u64,
        validator: BlockValidator,
    ) -> Self {
        Self {
            hash: header.hash,
            height: header.height,
            block,
            header,
            prev,
            prev_median_time_past,
            adjusted_time,
            flags: DeploymentFlags::default(),
            skip_validation: false,
            txids: Vec::new(),
            coins: None,
            stake: None,
            fees: 0,
            validator,
        }
    }

    /// Transaction ids, computed on first use.
    pub fn txids(&mut self) -> &[Hash256] {
        if self.txids.len() != self.block.transactions.len() {
            self.txids = self.block.transactions.iter().map(|tx| tx.txid()).collect();
        }
        &self.txids
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.block.is_proof_of_stake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_consensus::{consensus_params, Network};

    #[test]
    fn deployments_follow_heights() {
        let params = consensus_params(Network::PowRegtest);
        let early = DeploymentFlags::at_height(&params, 10, &[0u8; 32]);
        assert!(!early.enforce_bip34);
        assert!(early.segwit);
        assert_eq!(early.minimum_version, 1);
        assert_eq!(early.script_flags & SCRIPT_VERIFY_DERSIG, 0);

        let late = DeploymentFlags::at_height(&params, 2_000, &[0u8; 32]);
        assert!(late.enforce_bip34);
        assert!(late.enforce_sequence_locks);
        assert_eq!(late.minimum_version, 4);
        assert_ne!(late.script_flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, 0);
    }

    #[test]
    fn bip30_exceptions_disable_enforcement() {
        let mut params = consensus_params(Network::PowMainnet);
        params.bip30_exceptions.push((91_842, [4u8; 32]));
        assert!(!DeploymentFlags::at_height(&params, 91_842, &[4u8; 32]).enforce_bip30);
        assert!(DeploymentFlags::at_height(&params, 91_842, &[5u8; 32]).enforce_bip30);
    }
}
