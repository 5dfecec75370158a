//! Compact target encoding, chain work, and the proof-of-work retarget.

use hybridd_consensus::{ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    MissingAncestor(u32),
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingAncestor(height) => {
                write!(f, "retarget window ancestor at height {height} not found")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The header fields a retarget needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderInfo {
    pub height: u32,
    pub time: u32,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if size <= 3 {
        word >>= 8 * (3 - size);
    }
    if word != 0 && (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        U256::from(word)
    } else {
        if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32))
        {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };
    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    // The 0x00800000 bit is the sign; shift it out of the mantissa.
    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

/// Interprets a hash in internal byte order as a 256-bit integer.
pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash)
}

pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    hash_to_u256(hash) <= *target
}

/// Expected number of hashes to find a block at `bits`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    Ok((!target / (target + U256::one())) + U256::one())
}

/// Multiplies then divides without intermediate overflow.
pub fn mul_div(value: U256, multiplier: u64, divisor: u64) -> U256 {
    let product = value.full_mul(U256::from(multiplier));
    let quotient = product / U512::from(divisor.max(1));
    U256::try_from(quotient).unwrap_or(U256::MAX)
}

/// Bits required for the block after `prev` on a proof-of-work network.
///
/// `ancestor` resolves a header on the same chain as `prev` by height.
pub fn next_work_required(
    prev: &HeaderInfo,
    ancestor: impl Fn(u32) -> Option<HeaderInfo>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if params.pow_no_retargeting {
        return Ok(prev.bits);
    }

    let interval = params.difficulty_adjustment_interval();
    if (prev.height + 1) % interval != 0 {
        return Ok(prev.bits);
    }

    let first_height = prev.height.saturating_sub(interval - 1);
    let first = ancestor(first_height).ok_or(DifficultyError::MissingAncestor(first_height))?;
    calculate_next_work_required(prev, first.time, params)
}

pub fn calculate_next_work_required(
    prev: &HeaderInfo,
    first_block_time: u32,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let timespan = i64::from(params.pow_target_timespan);
    let actual = (i64::from(prev.time) - i64::from(first_block_time))
        .clamp(timespan / 4, timespan * 4);

    let limit = compact_to_u256(params.pow_limit)?;
    let old = compact_to_u256(prev.bits)?;
    let new = mul_div(old, actual as u64, timespan as u64).min(limit);
    Ok(u256_to_compact(new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_and_overflowing_bits_are_rejected() {
        assert_eq!(compact_to_u256(0x0480_0001), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0x2301_0000), Err(CompactError::Overflow));
        assert_eq!(compact_to_u256(0x0180_0000), Ok(U256::zero()));
    }

    #[test]
    fn slow_blocks_clamp_at_four_times() {
        let params = hybridd_consensus::consensus_params(hybridd_consensus::Network::PowMainnet);
        let prev = HeaderInfo {
            height: 2015,
            time: 100 * params.pow_target_timespan,
            bits: 0x1b04_04cb,
        };
        let clamped = calculate_next_work_required(&prev, 0, &params).expect("bits");
        let at_four = HeaderInfo {
            time: 4 * params.pow_target_timespan,
            ..prev
        };
        assert_eq!(
            clamped,
            calculate_next_work_required(&at_four, 0, &params).expect("bits")
        );
    }

    #[test]
    fn mul_div_survives_wide_products() {
        let value = U256::MAX >> 1;
        assert_eq!(mul_div(value, 4, 4), value);
    }
}
