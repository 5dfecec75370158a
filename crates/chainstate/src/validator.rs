//! Block and transaction checks shared by both network kinds, and the hooks
//! where proof-of-work and proof-of-stake validation differ.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use hybridd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT, MAX_COINBASE_SCRIPT_LEN,
    MIN_COINBASE_SCRIPT_LEN, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_GRANULARITY, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
    WITNESS_SCALE_FACTOR,
};
use hybridd_consensus::money::{checked_money_add, money_range, Amount, MAX_MONEY};
use hybridd_consensus::{
    hash256_to_hex, proof_of_stake_reward, proof_of_work_subsidy, ConsensusParams, Hash256,
    NetworkKind,
};
use hybridd_pos::{
    check_stake_depth, check_stake_kernel_hash, compute_stake_modifier_v2, next_target_required,
    stake_entropy_bit, stake_kernel_hash,
};
use hybridd_pow::{check_proof_of_work, next_work_required};
use hybridd_primitives::block::Block;
use hybridd_primitives::transaction::{Transaction, TxOut};
use hybridd_script::interpreter::{ScriptFlags, SCRIPT_VERIFY_P2SH};
use hybridd_script::opcodes::push_data;
use hybridd_script::sigops::{legacy_sigop_count, p2sh_sigop_count, witness_sigop_count};
use hybridd_script::standard::is_p2sh;
use hybridd_script::{verify_script, PrecomputedTransactionData, TransactionSignatureChecker};
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::context::RuleContext;
use crate::engine::ChainServices;
use crate::errors::{ConsensusError, ErrorCode};
use crate::index::ChainIndexer;
use crate::merkle::{witness_commitment, witness_commitment_index, witness_merkle_root};
use crate::stake::{BlockStake, STAKE_FLAG_ENTROPY, STAKE_FLAG_MODIFIER, STAKE_FLAG_PROOF_OF_STAKE};
use crate::view::UnspentOutputSet;

/// Network-kind specific validation hooks over one shared pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockValidator {
    ProofOfWork,
    ProofOfStake,
}

impl BlockValidator {
    pub fn for_kind(kind: NetworkKind) -> Self {
        match kind {
            NetworkKind::ProofOfWork => BlockValidator::ProofOfWork,
            NetworkKind::ProofOfStake => BlockValidator::ProofOfStake,
        }
    }

    /// Lower bound against the chain, upper bound against the local clock.
    pub fn check_header_time(
        self,
        ctx: &RuleContext,
        params: &ConsensusParams,
    ) -> Result<(), ConsensusError> {
        let time = ctx.header.header.time;
        let floor = match self {
            BlockValidator::ProofOfWork => ctx.prev_median_time_past,
            BlockValidator::ProofOfStake => ctx.prev.header.time,
        };
        if time <= floor {
            return Err(ConsensusError::new(ErrorCode::TimeTooOld)
                .with_message(format!("block time {time} not above {floor}")));
        }

        let drift = u64::from(params.max_future_drift);
        if u64::from(time) > ctx.adjusted_time.saturating_add(drift) {
            return Err(ConsensusError::new(ErrorCode::TimeTooNew)
                .with_message(format!(
                    "block time {time} beyond adjusted time {}",
                    ctx.adjusted_time
                ))
                .with_reject_until(u64::from(time) - drift));
        }
        Ok(())
    }

    /// Compact target the block must declare.
    pub fn next_work_required(
        self,
        ctx: &RuleContext,
        chain: &ChainIndexer,
        params: &ConsensusParams,
    ) -> Result<u32, ConsensusError> {
        let prev_hash = ctx.prev.hash;
        match self {
            BlockValidator::ProofOfWork => Ok(next_work_required(
                &ctx.prev.header_info(),
                |height| {
                    chain
                        .ancestor(&prev_hash, height)
                        .map(|entry| entry.header_info())
                },
                params,
            )?),
            BlockValidator::ProofOfStake => Ok(next_target_required(
                Some(ctx.prev.retarget_header()),
                ctx.is_proof_of_stake(),
                |height| {
                    chain
                        .ancestor(&prev_hash, height)
                        .map(|entry| entry.retarget_header())
                },
                params,
            )?),
        }
    }

    /// Header proof for work blocks. Stake blocks prove themselves through
    /// the kernel during full validation.
    pub fn check_header_proof(
        self,
        ctx: &RuleContext,
        params: &ConsensusParams,
    ) -> Result<(), ConsensusError> {
        if self == BlockValidator::ProofOfStake {
            if ctx.is_proof_of_stake() {
                return Ok(());
            }
            if params.last_pow_height.is_some_and(|last| ctx.height > last) {
                return Err(ConsensusError::new(ErrorCode::ProofOfWorkTooHigh));
            }
        }
        check_proof_of_work(&ctx.header.header, params)?;
        Ok(())
    }

    /// Only stake networks have coinstakes; elsewhere the same shape is an
    /// ordinary transaction.
    pub fn is_coinstake(self, tx: &Transaction) -> bool {
        self == BlockValidator::ProofOfStake && tx.is_coinstake()
    }

    /// Stake networks pay coinstake inputs back to the staker, so they are
    /// never fees.
    pub fn is_fee_bearing(self, tx: &Transaction) -> bool {
        !self.is_coinstake(tx)
    }

    /// Coinbase (or coinstake) may claim at most fees plus the block reward.
    pub fn check_block_reward(
        self,
        ctx: &RuleContext,
        params: &ConsensusParams,
    ) -> Result<(), ConsensusError> {
        let block = &ctx.block;
        let coinbase = block
            .transactions
            .first()
            .ok_or_else(|| ConsensusError::new(ErrorCode::BadCoinbaseMissing))?;
        let coinbase_out = coinbase
            .total_out()
            .filter(|value| money_range(*value))
            .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsTxoutTotalTooLarge))?;

        if self == BlockValidator::ProofOfStake && ctx.is_proof_of_stake() {
            let coinstake = &block.transactions[1];
            let value_in = ctx
                .stake
                .as_ref()
                .and_then(|stake| stake.coinstake_value_in)
                .ok_or_else(|| ConsensusError::new(ErrorCode::BadStakeBlock))?;
            let value_out = coinstake
                .total_out()
                .filter(|value| money_range(*value))
                .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsTxoutTotalTooLarge))?;
            let claimed = value_out - value_in + coinbase_out;
            let allowed = ctx.fees + proof_of_stake_reward(ctx.height, params);
            if claimed > allowed {
                return Err(ConsensusError::new(ErrorCode::BadCoinstakeAmount)
                    .with_message(format!("coinstake pays {claimed}, limit {allowed}")));
            }
            return Ok(());
        }

        let allowed = ctx.fees + proof_of_work_subsidy(ctx.height, params);
        if coinbase_out > allowed {
            return Err(ConsensusError::new(ErrorCode::BadCoinbaseAmount)
                .with_message(format!("reward too high: coinbase pays {coinbase_out}, limit {allowed}")));
        }
        Ok(())
    }
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), ConsensusError> {
    if tx.vin.is_empty() {
        return Err(ErrorCode::BadTxnsVinEmpty.into());
    }
    if tx.vout.is_empty() {
        return Err(ErrorCode::BadTxnsVoutEmpty.into());
    }
    if tx.base_size() as u64 * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT {
        return Err(ErrorCode::BadTxnsOversize.into());
    }

    let mut total: Amount = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ErrorCode::BadTxnsVoutNegative.into());
        }
        if output.value > MAX_MONEY {
            return Err(ErrorCode::BadTxnsVoutTooLarge.into());
        }
        total = checked_money_add(total, output.value)
            .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsTxoutTotalTooLarge))?;
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    if !tx.vin.iter().all(|input| seen.insert(input.prevout)) {
        return Err(ErrorCode::BadTxnsInputsDuplicate.into());
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(ErrorCode::BadCoinbaseLength.into());
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ErrorCode::BadTxnsPrevoutNull.into());
    }
    Ok(())
}

/// First transaction is the coinbase and no other is.
pub fn check_coinbase_placement(block: &Block) -> Result<(), ConsensusError> {
    match block.transactions.first() {
        Some(tx) if tx.is_coinbase() => {}
        _ => return Err(ErrorCode::BadCoinbaseMissing.into()),
    }
    if block.transactions.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(ErrorCode::BadCoinbaseMultiple.into());
    }
    Ok(())
}

pub fn check_block_size(block: &Block) -> Result<(), ConsensusError> {
    let count = block.transactions.len() as u64;
    if count == 0
        || count * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT
        || block.stripped_size() as u64 * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT
    {
        return Err(ErrorCode::BadBlockLength.into());
    }
    if block.weight() > MAX_BLOCK_WEIGHT {
        return Err(ErrorCode::BadBlockWeight.into());
    }
    Ok(())
}

pub fn is_final_tx(tx: &Transaction, height: u32, cutoff_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let compare = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        cutoff_time
    };
    if tx.lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// The script prefix a coinbase carries once height commitments are enforced.
pub fn coinbase_height_script(height: u32) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1: u8 = 0x51;
    if height == 0 {
        return vec![OP_0];
    }
    if height <= 16 {
        return vec![OP_1 + (height as u8 - 1)];
    }
    let mut data = Vec::with_capacity(5);
    let mut rest = height;
    while rest > 0 {
        data.push((rest & 0xff) as u8);
        rest >>= 8;
    }
    if data.last().is_some_and(|last| last & 0x80 != 0) {
        data.push(0);
    }
    let mut script = Vec::with_capacity(data.len() + 1);
    push_data(&mut script, &data);
    script
}

pub fn coinbase_height_matches(tx: &Transaction, height: u32) -> bool {
    tx.vin
        .first()
        .is_some_and(|input| input.script_sig.starts_with(&coinbase_height_script(height)))
}

/// Segwit commitment, or no witness data at all when there is none.
pub fn check_witness_commitment(block: &Block, segwit: bool) -> Result<(), ConsensusError> {
    let commitment = if segwit {
        witness_commitment_index(block)
    } else {
        None
    };
    let Some(index) = commitment else {
        if block.transactions.iter().any(Transaction::has_witness) {
            return Err(ErrorCode::UnexpectedWitness.into());
        }
        return Ok(());
    };

    let coinbase = &block.transactions[0];
    let reserved: Hash256 = match coinbase.vin[0].witness.as_slice() {
        [item] => item
            .as_slice()
            .try_into()
            .map_err(|_| ConsensusError::new(ErrorCode::BadWitnessNonceSize))?,
        _ => return Err(ErrorCode::BadWitnessNonceSize.into()),
    };
    let (root, _) = witness_merkle_root(&block.transactions);
    let expected = witness_commitment(&root, &reserved);
    if coinbase.vout[index].script_pubkey[6..38] != expected {
        return Err(ErrorCode::BadWitnessMerkleMatch.into());
    }
    Ok(())
}

pub fn legacy_tx_sigops(tx: &Transaction) -> u64 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| legacy_sigop_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| legacy_sigop_count(&output.script_pubkey, false))
        .sum();
    u64::from(inputs) + u64::from(outputs)
}

/// Legacy sigops of the whole block, scaled to cost units.
pub fn block_legacy_sigop_cost(block: &Block) -> u64 {
    block.transactions.iter().map(legacy_tx_sigops).sum::<u64>() * WITNESS_SCALE_FACTOR
}

/// Full sigop cost of `tx` given the outputs it spends.
pub fn tx_sigop_cost(tx: &Transaction, view: &UnspentOutputSet, flags: ScriptFlags) -> u64 {
    let mut cost = legacy_tx_sigops(tx) * WITNESS_SCALE_FACTOR;
    if tx.is_coinbase() {
        return cost;
    }
    for input in &tx.vin {
        let Some(spent) = view.spent_output(&input.prevout) else {
            continue;
        };
        if flags & SCRIPT_VERIFY_P2SH != 0 && is_p2sh(&spent.script_pubkey) {
            cost += u64::from(p2sh_sigop_count(&input.script_sig, &spent.script_pubkey))
                * WITNESS_SCALE_FACTOR;
        }
        cost += u64::from(witness_sigop_count(
            &input.script_sig,
            &spent.script_pubkey,
            &input.witness,
            flags,
        ));
    }
    cost
}

/// BIP68 `(min_height, min_time)`; -1 means unconstrained.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    prev_heights: &[u32],
    enforce: bool,
    median_time_at: impl Fn(u32) -> Option<u32>,
) -> Result<(i64, i64), ConsensusError> {
    let mut min_height = -1i64;
    let mut min_time = -1i64;
    if !enforce || tx.version < 2 {
        return Ok((min_height, min_time));
    }
    for (input, coin_height) in tx.vin.iter().zip(prev_heights) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let masked = i64::from(input.sequence & SEQUENCE_LOCKTIME_MASK);
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let base = coin_height.saturating_sub(1);
            let coin_time = median_time_at(base).ok_or_else(|| {
                ConsensusError::new(ErrorCode::PrevBlockNotFound)
                    .with_message(format!("no median time at height {base}"))
            })?;
            min_time = min_time
                .max(i64::from(coin_time) + (masked << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            min_height = min_height.max(i64::from(*coin_height) + masked - 1);
        }
    }
    Ok((min_height, min_time))
}

pub fn evaluate_sequence_locks(lock: (i64, i64), height: u32, prev_median_time_past: u32) -> bool {
    lock.0 < i64::from(height) && lock.1 < i64::from(prev_median_time_past)
}

/// Maturity, timestamps, and value range of everything `tx` spends; returns
/// the input total.
pub fn check_tx_inputs(
    tx: &Transaction,
    view: &UnspentOutputSet,
    spend_height: u32,
    params: &ConsensusParams,
) -> Result<Amount, ConsensusError> {
    let mut value_in: Amount = 0;
    for input in &tx.vin {
        let coins = view
            .access_coins(&input.prevout.hash)
            .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsInputsMissingOrSpent))?;
        let spent = coins
            .output(input.prevout.index)
            .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsInputsMissingOrSpent))?;
        if !coins.is_mature(spend_height, params.coinbase_maturity) {
            return Err(ConsensusError::new(ErrorCode::BadTxnsPrematureSpend).with_message(
                format!(
                    "tried to spend output of height {} at height {spend_height}",
                    coins.height
                ),
            ));
        }
        if tx.time.is_some_and(|time| coins.time > time) {
            return Err(ErrorCode::BadTxnsTimeEarlierThanInput.into());
        }
        if !money_range(spent.value) {
            return Err(ErrorCode::BadTxnsInputValuesOutOfRange.into());
        }
        value_in = checked_money_add(value_in, spent.value)
            .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsInputValuesOutOfRange))?;
    }
    Ok(value_in)
}

/// Verifies the coinstake against its staked output and returns the kernel
/// hash.
pub fn check_proof_of_stake(
    ctx: &RuleContext,
    view: &UnspentOutputSet,
    services: &ChainServices,
) -> Result<Hash256, ConsensusError> {
    let block = &ctx.block;
    let coinstake = block
        .transactions
        .get(1)
        .filter(|tx| tx.is_coinstake())
        .ok_or_else(|| ConsensusError::new(ErrorCode::BadStakeBlock))?;
    let stake_input = &coinstake.vin[0];
    let coins = view.access_coins(&stake_input.prevout.hash).ok_or_else(|| {
        ConsensusError::new(ErrorCode::BadStakeBlock).with_message(format!(
            "staked output {}:{} not found",
            hash256_to_hex(&stake_input.prevout.hash),
            stake_input.prevout.index
        ))
    })?;
    let staked = coins
        .output(stake_input.prevout.index)
        .ok_or_else(|| ConsensusError::new(ErrorCode::BadStakeBlock))?;

    let precomputed = PrecomputedTransactionData::new(coinstake);
    let checker = TransactionSignatureChecker::new(coinstake, 0, staked.value, Some(&precomputed));
    verify_script(
        &stake_input.script_sig,
        &staked.script_pubkey,
        &stake_input.witness,
        ctx.flags.script_flags,
        &checker,
    )
    .map_err(|err| {
        ConsensusError::new(ErrorCode::BadScript)
            .with_message(format!("coinstake signature invalid: {err}"))
    })?;

    check_stake_depth(ctx.prev.height, coins.height, &services.params)?;

    let prev_stake = services
        .stakes
        .get(&ctx.prev.hash)?
        .ok_or_else(|| ConsensusError::new(ErrorCode::PrevStakeNull))?;
    let coinstake_time = coinstake.time.unwrap_or(block.header.time);
    Ok(check_stake_kernel_hash(
        &prev_stake.stake_modifier_v2,
        coins.time,
        &stake_input.prevout,
        coinstake_time,
        block.header.bits,
        staked.value,
    )?)
}

/// Stake record for the block in `ctx`: proof hash, entropy bit and the
/// chained modifier, copied from the checkpoint table where one is pinned.
pub fn compute_block_stake(
    ctx: &RuleContext,
    view: Option<&UnspentOutputSet>,
    services: &ChainServices,
) -> Result<BlockStake, ConsensusError> {
    let prev_stake = services.stakes.get(&ctx.prev.hash)?.ok_or_else(|| {
        ConsensusError::new(ErrorCode::PrevStakeNull).with_message(format!(
            "no stake record for {}",
            hash256_to_hex(&ctx.prev.hash)
        ))
    })?;

    let mut stake = BlockStake::proof_of_work(ctx.hash);
    if ctx.is_proof_of_stake() {
        let coinstake = &ctx.block.transactions[1];
        let prevout = coinstake.vin[0].prevout;
        stake.flags |= STAKE_FLAG_PROOF_OF_STAKE;
        stake.prevout_stake = prevout;
        stake.stake_time = coinstake.time.unwrap_or(ctx.block.header.time);
        stake.hash_proof = match view {
            Some(view) if !ctx.skip_validation => check_proof_of_stake(ctx, view, services)?,
            _ => view
                .and_then(|view| view.access_coins(&prevout.hash))
                .map(|coins| {
                    stake_kernel_hash(
                        &prev_stake.stake_modifier_v2,
                        coins.time,
                        &prevout,
                        stake.stake_time,
                    )
                })
                .unwrap_or(ctx.hash),
        };
    }
    if stake_entropy_bit(&ctx.hash) {
        stake.flags |= STAKE_FLAG_ENTROPY;
    }

    let pinned = (ctx.height <= services.checkpoints.last_checkpoint_height())
        .then(|| services.checkpoints.checkpoint(ctx.height))
        .flatten()
        .and_then(|checkpoint| checkpoint.stake_modifier);
    stake.stake_modifier_v2 = match pinned {
        Some(modifier) => modifier,
        None => compute_stake_modifier_v2(
            Some(&prev_stake.stake_modifier_v2),
            &stake.kernel_selector(),
        ),
    };
    stake.flags |= STAKE_FLAG_MODIFIER;
    Ok(stake)
}

struct ScriptCheck {
    tx_index: usize,
    input_index: usize,
    spent: TxOut,
}

/// Spends and creates coins for every transaction in block order. Unless
/// validation is skipped, also enforces maturity, sequence locks, sigop cost,
/// fees, scripts and the block reward.
pub fn execute_block(ctx: &mut RuleContext, services: &ChainServices) -> Result<(), ConsensusError> {
    let mut view = ctx
        .coins
        .take()
        .ok_or_else(|| ConsensusError::store_failure("coin view not loaded"))?;
    let result = execute_transactions(ctx, services, &mut view);
    ctx.coins = Some(view);
    result
}

fn execute_transactions(
    ctx: &mut RuleContext,
    services: &ChainServices,
    view: &mut UnspentOutputSet,
) -> Result<(), ConsensusError> {
    let params = &services.params;
    let block = Arc::clone(&ctx.block);
    let txids = ctx.txids().to_vec();
    let skip = ctx.skip_validation;
    let flags = ctx.flags;
    let height = ctx.height;
    let prev_hash = ctx.prev.hash;
    let chain = &services.chain;
    let median_time_at = |at: u32| {
        chain
            .ancestor(&prev_hash, at)
            .and_then(|entry| chain.median_time_past(&entry.hash))
    };

    let mut fees: Amount = 0;
    let mut sigop_cost: u64 = 0;
    let mut coinstake_value_in = None;
    let mut checks = Vec::new();

    for (tx_index, (tx, txid)) in block.transactions.iter().zip(&txids).enumerate() {
        if !tx.is_coinbase() {
            if !view.have_inputs(tx) {
                return Err(ConsensusError::new(ErrorCode::BadTxnsInputsMissingOrSpent)
                    .with_message(format!("inputs missing or spent in {}", hash256_to_hex(txid))));
            }
        }

        if !skip {
            sigop_cost += tx_sigop_cost(tx, view, flags.script_flags);
            if sigop_cost > MAX_BLOCK_SIGOPS_COST {
                return Err(ErrorCode::BadBlockSigops.into());
            }
        }

        if !skip && !tx.is_coinbase() {
            let value_in = check_tx_inputs(tx, view, height, params)?;

            let prev_heights: SmallVec<[u32; 8]> = tx
                .vin
                .iter()
                .map(|input| {
                    view.access_coins(&input.prevout.hash)
                        .map_or(0, |coins| coins.height)
                })
                .collect();
            let lock = calculate_sequence_locks(
                tx,
                &prev_heights,
                flags.enforce_sequence_locks,
                median_time_at,
            )?;
            if !evaluate_sequence_locks(lock, height, ctx.prev_median_time_past) {
                return Err(ErrorCode::BadTxnsSequenceLocks.into());
            }

            let fee_bearing = ctx.validator.is_fee_bearing(tx);
            if fee_bearing {
                let value_out = tx
                    .total_out()
                    .filter(|value| money_range(*value))
                    .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsTxoutTotalTooLarge))?;
                if value_in < value_out {
                    return Err(ConsensusError::new(ErrorCode::BadTxnsInBelowOut).with_message(
                        format!("value in {value_in} below value out {value_out}"),
                    ));
                }
                fees = checked_money_add(fees, value_in - value_out)
                    .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsFeeOutOfRange))?;
            } else {
                coinstake_value_in = Some(value_in);
            }

            for (input_index, input) in tx.vin.iter().enumerate() {
                // the kernel input is verified with the stake proof
                if !fee_bearing && input_index == 0 {
                    continue;
                }
                let spent = view
                    .spent_output(&input.prevout)
                    .cloned()
                    .ok_or_else(|| ConsensusError::new(ErrorCode::BadTxnsInputsMissingOrSpent))?;
                checks.push(ScriptCheck {
                    tx_index,
                    input_index,
                    spent,
                });
            }
        }

        let coinstake = ctx.validator.is_coinstake(tx);
        view.update(tx, *txid, height, block.header.time, coinstake)?;
    }

    ctx.fees = fees;
    if skip {
        return Ok(());
    }

    verify_scripts(&block, &checks, flags.script_flags, services)?;
    if let Some(value_in) = coinstake_value_in {
        ctx.stake.get_or_insert_with(Default::default).coinstake_value_in = Some(value_in);
    }
    ctx.validator.check_block_reward(ctx, params)
}

fn verify_scripts(
    block: &Block,
    checks: &[ScriptCheck],
    flags: ScriptFlags,
    services: &ChainServices,
) -> Result<(), ConsensusError> {
    if checks.is_empty() {
        return Ok(());
    }
    let start = Instant::now();
    let mut precomputed: Vec<Option<PrecomputedTransactionData>> =
        (0..block.transactions.len()).map(|_| None).collect();
    for check in checks {
        let slot = &mut precomputed[check.tx_index];
        if slot.is_none() {
            *slot = Some(PrecomputedTransactionData::new(
                &block.transactions[check.tx_index],
            ));
        }
    }

    let run = || {
        checks.par_iter().try_for_each(|check| {
            let tx = &block.transactions[check.tx_index];
            let input = &tx.vin[check.input_index];
            let checker = TransactionSignatureChecker::new(
                tx,
                check.input_index,
                check.spent.value,
                precomputed[check.tx_index].as_ref(),
            );
            verify_script(
                &input.script_sig,
                &check.spent.script_pubkey,
                &input.witness,
                flags,
                &checker,
            )
            .map_err(|err| (check.tx_index, check.input_index, err))
        })
    };
    let result = match services.script_pool.as_deref() {
        Some(pool) => pool.install(run),
        None => run(),
    };
    services.metrics.record_scripts(checks.len(), start.elapsed());

    if let Err((tx_index, input_index, err)) = result {
        let txid = block.transactions[tx_index].txid();
        hybridd_log::log_warn!(
            "script validation failed for tx {} input {}: {}",
            hash256_to_hex(&txid),
            input_index,
            err
        );
        return Err(ConsensusError::new(ErrorCode::BadScript).with_message(format!(
            "script failed for {} input {input_index}: {err}",
            hash256_to_hex(&txid)
        )));
    }
    Ok(())
}
