//! Stake-era difficulty retarget.
//!
//! Proof-of-stake and proof-of-work blocks on a stake network retarget
//! independently: each type only looks at the two most recent blocks of its own
//! type and moves the target towards the spacing observed between them.

use hybridd_consensus::ConsensusParams;
use hybridd_pow::difficulty::{compact_to_u256, mul_div, u256_to_compact};

use crate::PosError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetargetHeader {
    pub height: u32,
    pub time: u32,
    pub bits: u32,
    pub proof_of_stake: bool,
}

/// Bits required for the block after `tip`.
///
/// `ancestor` resolves a header on the same chain as `tip` by height.
pub fn next_target_required(
    tip: Option<RetargetHeader>,
    proof_of_stake: bool,
    ancestor: impl Fn(u32) -> Option<RetargetHeader>,
    params: &ConsensusParams,
) -> Result<u32, PosError> {
    let limit = if proof_of_stake {
        params.pos_limit
    } else {
        params.pow_limit
    };
    let no_retargeting = if proof_of_stake {
        params.pos_no_retargeting
    } else {
        params.pow_no_retargeting
    };

    let Some(tip) = tip else {
        return Ok(limit);
    };
    if no_retargeting {
        return Ok(tip.bits);
    }

    let last = last_of_kind(tip, proof_of_stake, &ancestor)?;
    if last.height == 0 {
        return Ok(limit);
    }
    let before_last = parent(&last, &ancestor)?;
    let second = last_of_kind(before_last, proof_of_stake, &ancestor)?;
    if second.height == 0 {
        return Ok(limit);
    }

    calculate_retarget(last.time, last.bits, second.time, limit, params)
}

/// `old × ((N-1)·s + 2·a) / ((N+1)·s)`, with `a` clamped to `[0, 10·s]` and the
/// result bounded by `limit`.
pub fn calculate_retarget(
    first_time: u32,
    first_bits: u32,
    second_time: u32,
    limit: u32,
    params: &ConsensusParams,
) -> Result<u32, PosError> {
    let spacing = u64::from(params.pos_target_spacing);
    let actual = u64::from(first_time.saturating_sub(second_time)).min(spacing * 10);
    let interval = params.pos_retarget_interval();

    let old = compact_to_u256(first_bits)?;
    let new = mul_div(
        old,
        (interval - 1) * spacing + 2 * actual,
        (interval + 1) * spacing,
    );

    let ceiling = compact_to_u256(limit)?;
    if new.is_zero() || new > ceiling {
        return Ok(limit);
    }
    Ok(u256_to_compact(new))
}

fn parent(
    header: &RetargetHeader,
    ancestor: &impl Fn(u32) -> Option<RetargetHeader>,
) -> Result<RetargetHeader, PosError> {
    let height = header.height - 1;
    ancestor(height).ok_or(PosError::MissingAncestor(height))
}

fn last_of_kind(
    mut header: RetargetHeader,
    proof_of_stake: bool,
    ancestor: &impl Fn(u32) -> Option<RetargetHeader>,
) -> Result<RetargetHeader, PosError> {
    while header.height > 0 && header.proof_of_stake != proof_of_stake {
        header = parent(&header, ancestor)?;
    }
    Ok(header)
}
