//! Ordered consensus rules, grouped into phases.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use hybridd_consensus::constants::MAX_BLOCK_SIGOPS_COST;
use hybridd_consensus::{hash256_to_hex, Hash256, NetworkKind};
use hybridd_pos::{check_block_shape, check_block_signature, check_coinstake_timestamp};
use hybridd_primitives::block::Block;

use crate::coins::{CoinStore, CoinTip};
use crate::context::{DeploymentFlags, RuleContext};
use crate::engine::ChainServices;
use crate::errors::{ConsensusError, ErrorCode};
use crate::merkle::{block_merkle_root, has_duplicate_txids};
use crate::validator::{
    block_legacy_sigop_cost, check_block_size, check_coinbase_placement, check_transaction,
    check_witness_commitment, coinbase_height_matches, compute_block_stake, execute_block,
    is_final_tx,
};
use crate::view::UnspentOutputSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RulePhase {
    Header,
    Integrity,
    Partial,
    Full,
}

impl RulePhase {
    pub const ALL: [RulePhase; 4] = [
        RulePhase::Header,
        RulePhase::Integrity,
        RulePhase::Partial,
        RulePhase::Full,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RulePhase::Header => "header",
            RulePhase::Integrity => "integrity",
            RulePhase::Partial => "partial",
            RulePhase::Full => "full",
        }
    }
}

impl fmt::Display for RulePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait ConsensusRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> RulePhase;

    fn run(&self, ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError>;
}

pub type RuleFn = fn(&mut RuleContext, &ChainServices) -> Result<(), ConsensusError>;

/// A rule backed by a plain function.
#[derive(Clone, Copy)]
pub struct FnRule {
    name: &'static str,
    phase: RulePhase,
    check: RuleFn,
}

impl FnRule {
    pub const fn new(name: &'static str, phase: RulePhase, check: RuleFn) -> Self {
        Self { name, phase, check }
    }
}

impl ConsensusRule for FnRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn phase(&self) -> RulePhase {
        self.phase
    }

    fn run(&self, ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
        (self.check)(ctx, services)
    }
}

/// Rules in registration order. Each phase runs its own rules in that order.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Box<dyn ConsensusRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_network(kind: NetworkKind) -> Self {
        let mut set = Self::new();
        let pos = kind == NetworkKind::ProofOfStake;

        set.register(FnRule::new("header-time", RulePhase::Header, header_time));
        set.register(FnRule::new("check-difficulty", RulePhase::Header, check_difficulty));
        set.register(FnRule::new("check-pow", RulePhase::Header, check_pow));
        set.register(FnRule::new("header-version", RulePhase::Header, header_version));

        set.register(FnRule::new("block-merkle-root", RulePhase::Integrity, merkle_root));
        if pos {
            set.register(FnRule::new(
                "pos-block-signature",
                RulePhase::Integrity,
                pos_block_signature,
            ));
        }

        set.register(FnRule::new(
            "set-activation-deployments",
            RulePhase::Partial,
            set_deployments,
        ));
        set.register(FnRule::new("checkpoints", RulePhase::Partial, checkpoints));
        set.register(FnRule::new("assume-valid", RulePhase::Partial, assume_valid));
        set.register(FnRule::new("transaction-locktime", RulePhase::Partial, locktime));
        set.register(FnRule::new("coinbase-height", RulePhase::Partial, coinbase_height));
        set.register(FnRule::new(
            "witness-commitment",
            RulePhase::Partial,
            witness_commitment,
        ));
        set.register(FnRule::new("block-size", RulePhase::Partial, block_size));
        set.register(FnRule::new("ensure-coinbase", RulePhase::Partial, ensure_coinbase));
        if pos {
            set.register(FnRule::new(
                "check-pos-transactions",
                RulePhase::Partial,
                pos_transactions,
            ));
        }
        set.register(FnRule::new("check-transactions", RulePhase::Partial, transactions));
        set.register(FnRule::new("check-sigops", RulePhase::Partial, sigops));

        set.register(FnRule::new("load-coinview", RulePhase::Full, load_coinview));
        set.register(FnRule::new("bip30", RulePhase::Full, bip30));
        if pos {
            set.register(FnRule::new("pos-compute-stake", RulePhase::Full, compute_stake));
        }
        set.register(FnRule::new("coinview-execution", RulePhase::Full, coinview_execution));
        set.register(FnRule::new("save-coinview", RulePhase::Full, save_coinview));
        set
    }

    pub fn register(&mut self, rule: impl ConsensusRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    /// Swaps the rule called `name` in place; false when there is none.
    pub fn replace(&mut self, name: &str, rule: impl ConsensusRule + 'static) -> bool {
        match self.rules.iter_mut().find(|existing| existing.name() == name) {
            Some(slot) => {
                *slot = Box::new(rule);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name() != name);
        self.rules.len() != before
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs the rules of `phase`, stopping at the first error.
    pub fn execute(
        &self,
        phase: RulePhase,
        ctx: &mut RuleContext,
        services: &ChainServices,
        skip_rules: &[&str],
    ) -> Result<(), ConsensusError> {
        let start = Instant::now();
        for rule in self.rules.iter().filter(|rule| rule.phase() == phase) {
            if skip_rules.contains(&rule.name()) {
                continue;
            }
            if let Err(err) = rule.run(ctx, services) {
                hybridd_log::log_debug!(
                    "rule {} rejected block {} at height {}: {}",
                    rule.name(),
                    hash256_to_hex(&ctx.hash),
                    ctx.height,
                    err
                );
                return Err(err);
            }
        }
        services.metrics.record_phase(phase, start.elapsed());
        Ok(())
    }
}

/// Ids the coin view must hold to execute `block`: every spent txid and,
/// when BIP30 is enforced, the block's own txids.
pub fn ids_to_fetch(block: &Block, enforce_bip30: bool) -> Vec<Hash256> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    if enforce_bip30 {
        for tx in &block.transactions {
            let txid = tx.txid();
            if seen.insert(txid) {
                ids.push(txid);
            }
        }
    }
    for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
        for input in &tx.vin {
            if seen.insert(input.prevout.hash) {
                ids.push(input.prevout.hash);
            }
        }
    }
    ids
}

fn header_time(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    ctx.validator.check_header_time(ctx, &services.params)
}

fn check_difficulty(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    let expected = ctx
        .validator
        .next_work_required(ctx, &services.chain, &services.params)?;
    let bits = ctx.header.header.bits;
    if bits != expected {
        return Err(ConsensusError::new(ErrorCode::BadDiffBits)
            .with_message(format!("bits {bits:08x}, expected {expected:08x}")));
    }
    Ok(())
}

fn check_pow(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    ctx.validator.check_header_proof(ctx, &services.params)
}

fn header_version(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    let minimum = DeploymentFlags::at_height(&services.params, ctx.height, &ctx.hash).minimum_version;
    let version = ctx.header.header.version;
    if version < minimum {
        return Err(ConsensusError::new(ErrorCode::BadVersion)
            .with_message(format!("version {version} below {minimum}")));
    }
    Ok(())
}

fn merkle_root(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    let (root, mutated) = block_merkle_root(ctx.txids());
    if root != ctx.block.header.merkle_root {
        return Err(ErrorCode::BadMerkleRoot.into());
    }
    if mutated || has_duplicate_txids(ctx.txids()) {
        return Err(ErrorCode::BadTxnsDuplicate.into());
    }
    Ok(())
}

fn pos_block_signature(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    Ok(check_block_signature(&ctx.block)?)
}

fn set_deployments(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    ctx.flags = DeploymentFlags::at_height(&services.params, ctx.height, &ctx.hash);
    Ok(())
}

fn checkpoints(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    let checkpoints = &services.checkpoints;
    if !checkpoints.check_hardened(ctx.height, &ctx.hash) {
        return Err(ConsensusError::new(ErrorCode::CheckpointMismatch).with_message(format!(
            "block {} at height {} conflicts with checkpoint",
            hash256_to_hex(&ctx.hash),
            ctx.height
        )));
    }
    if ctx.height <= checkpoints.last_checkpoint_height() {
        ctx.skip_validation = true;
    }
    Ok(())
}

fn assume_valid(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    if ctx.skip_validation {
        return Ok(());
    }
    let Some(assumed) = services.params.assume_valid else {
        return Ok(());
    };
    let below_assumed = services
        .chain
        .ancestor(&assumed, ctx.height)
        .is_some_and(|ancestor| ancestor.hash == ctx.hash);
    if below_assumed {
        ctx.skip_validation = true;
    }
    Ok(())
}

fn locktime(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    let cutoff = if ctx.flags.locktime_median_time_past {
        ctx.prev_median_time_past
    } else {
        ctx.block.header.time
    };
    let height = ctx.height;
    if let Some(index) = ctx
        .block
        .transactions
        .iter()
        .position(|tx| !is_final_tx(tx, height, cutoff))
    {
        return Err(ConsensusError::new(ErrorCode::BadTxnsNonFinal)
            .with_message(format!("transaction {index} is not final")));
    }
    Ok(())
}

fn coinbase_height(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    if !ctx.flags.enforce_bip34 {
        return Ok(());
    }
    match ctx.block.transactions.first() {
        Some(coinbase) if coinbase_height_matches(coinbase, ctx.height) => Ok(()),
        _ => Err(ErrorCode::BadCoinbaseHeight.into()),
    }
}

fn witness_commitment(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    check_witness_commitment(&ctx.block, ctx.flags.segwit)
}

fn block_size(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    check_block_size(&ctx.block)
}

fn ensure_coinbase(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    check_coinbase_placement(&ctx.block)
}

fn pos_transactions(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    check_block_shape(&ctx.block)?;
    if ctx.is_proof_of_stake() {
        let block_time = ctx.block.header.time;
        let coinstake_time = ctx.block.transactions[1]
            .time
            .ok_or_else(|| ConsensusError::new(ErrorCode::BadCoinstakeTime))?;
        check_coinstake_timestamp(block_time, coinstake_time, &services.params)?;
    }
    Ok(())
}

fn transactions(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    ctx.block.transactions.iter().try_for_each(check_transaction)
}

fn sigops(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    if block_legacy_sigop_cost(&ctx.block) > MAX_BLOCK_SIGOPS_COST {
        return Err(ErrorCode::BadBlockSigops.into());
    }
    Ok(())
}

fn load_coinview(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    let coin_tip = services.coins.current_tip_hash()?;
    if coin_tip != ctx.prev.hash {
        return Err(ConsensusError::new(ErrorCode::InvalidPrevTip).with_message(format!(
            "coin view at {}, block builds on {}",
            hash256_to_hex(&coin_tip),
            hash256_to_hex(&ctx.prev.hash)
        )));
    }

    let ids = ids_to_fetch(&ctx.block, ctx.flags.enforce_bip30);
    let start = Instant::now();
    let records = services.coins.fetch(&ids)?;
    services.metrics.record_coin_fetch(ids.len(), start.elapsed());

    let mut view = UnspentOutputSet::new();
    view.set_coins(ids.into_iter().zip(records));
    ctx.coins = Some(view);
    Ok(())
}

fn bip30(ctx: &mut RuleContext, _services: &ChainServices) -> Result<(), ConsensusError> {
    if !ctx.flags.enforce_bip30 {
        return Ok(());
    }
    let txids = ctx.txids().to_vec();
    let Some(view) = ctx.coins.as_ref() else {
        return Err(ConsensusError::store_failure("coin view not loaded"));
    };
    if let Some(txid) = txids.iter().find(|txid| view.access_coins(txid).is_some()) {
        return Err(ConsensusError::new(ErrorCode::BadTxnsBip30)
            .with_message(format!("transaction {} overwrites unspent outputs", hash256_to_hex(txid))));
    }
    Ok(())
}

fn compute_stake(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    let stake = compute_block_stake(ctx, ctx.coins.as_ref(), services)?;
    ctx.stake.get_or_insert_with(Default::default).block_stake = stake;
    Ok(())
}

fn coinview_execution(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    execute_block(ctx, services)
}

fn save_coinview(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    let view = ctx
        .coins
        .take()
        .ok_or_else(|| ConsensusError::store_failure("coin view not loaded"))?;
    let (outputs, rewind) = view.into_changes(ctx.height, ctx.prev.hash);
    services.coins.save(
        &outputs,
        &[rewind],
        &ctx.prev.hash,
        CoinTip {
            hash: ctx.hash,
            height: ctx.height,
        },
    )?;
    if let Some(stake) = ctx.stake.as_ref() {
        services
            .stakes
            .set(ctx.hash, ctx.height, stake.block_stake.clone())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_primitives::block::BlockHeader;
    use hybridd_primitives::outpoint::OutPoint;
    use hybridd_primitives::transaction::{Transaction, TxIn, TxOut};

    #[test]
    fn network_rule_lists_are_ordered_by_phase() {
        for kind in [NetworkKind::ProofOfWork, NetworkKind::ProofOfStake] {
            let set = RuleSet::for_network(kind);
            let phases: Vec<RulePhase> = set.rules.iter().map(|rule| rule.phase()).collect();
            let mut sorted = phases.clone();
            sorted.sort();
            assert_eq!(phases, sorted);
        }
        let pow = RuleSet::for_network(NetworkKind::ProofOfWork).names();
        let pos = RuleSet::for_network(NetworkKind::ProofOfStake).names();
        assert!(!pow.contains(&"pos-compute-stake"));
        assert!(pos.contains(&"pos-block-signature"));
        assert_eq!(pos.len(), pow.len() + 3);
    }

    #[test]
    fn replace_and_remove_by_name() {
        fn accept(_: &mut RuleContext, _: &ChainServices) -> Result<(), ConsensusError> {
            Ok(())
        }
        let mut set = RuleSet::for_network(NetworkKind::ProofOfWork);
        let count = set.len();
        assert!(set.replace("check-pow", FnRule::new("check-pow", RulePhase::Header, accept)));
        assert!(!set.replace("missing", FnRule::new("missing", RulePhase::Header, accept)));
        assert_eq!(set.len(), count);
        assert!(set.remove("bip30"));
        assert!(!set.names().contains(&"bip30"));
    }

    #[test]
    fn fetch_ids_are_unique_and_skip_coinbase() {
        let coinbase = Transaction {
            version: 1,
            time: None,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x51, 0x51], u32::MAX)],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        let spend = Transaction {
            version: 1,
            time: None,
            vin: vec![
                TxIn::new(OutPoint::new([3; 32], 0), vec![], u32::MAX),
                TxIn::new(OutPoint::new([3; 32], 1), vec![], u32::MAX),
                TxIn::new(OutPoint::new([4; 32], 0), vec![], u32::MAX),
            ],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0; 32],
                merkle_root: [0; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![coinbase.clone(), spend.clone()],
            signature: None,
        };
        assert_eq!(ids_to_fetch(&block, false), vec![[3; 32], [4; 32]]);
        assert_eq!(
            ids_to_fetch(&block, true),
            vec![coinbase.txid(), spend.txid(), [3; 32], [4; 32]]
        );
    }
}
