use hybridd_consensus::money::Amount;
use hybridd_consensus::{ConsensusParams, Hash256};
use hybridd_pow::difficulty::{compact_to_u256, hash_to_u256};
use hybridd_primitives::encoding::{Encodable, Encoder};
use hybridd_primitives::hash::sha256d;
use hybridd_primitives::outpoint::OutPoint;
use primitive_types::{U256, U512};

use crate::PosError;

/// `sha256d(modifier ∥ coin_time ∥ prevout.hash ∥ prevout.index ∥ coinstake_time)`.
pub fn stake_kernel_hash(
    stake_modifier_v2: &Hash256,
    coin_time: u32,
    prevout: &OutPoint,
    coinstake_time: u32,
) -> Hash256 {
    let mut encoder = Encoder::with_capacity(32 + 4 + 36 + 4);
    encoder.write_hash(stake_modifier_v2);
    encoder.write_u32_le(coin_time);
    prevout.consensus_encode(&mut encoder);
    encoder.write_u32_le(coinstake_time);
    sha256d(&encoder.into_inner())
}

/// Runs the kernel against `bits` weighted by the staked value and returns the
/// proof hash on success.
pub fn check_stake_kernel_hash(
    stake_modifier_v2: &Hash256,
    coin_time: u32,
    prevout: &OutPoint,
    coinstake_time: u32,
    bits: u32,
    value: Amount,
) -> Result<Hash256, PosError> {
    if coinstake_time < coin_time {
        return Err(PosError::StakeTimeViolation);
    }

    let target = compact_to_u256(bits)?;
    let weight = u64::try_from(value).unwrap_or(0);
    let weighted_target = target.full_mul(U256::from(weight));

    let proof = stake_kernel_hash(stake_modifier_v2, coin_time, prevout, coinstake_time);
    if U512::from(hash_to_u256(&proof)) > weighted_target {
        return Err(PosError::StakeHashInvalidTarget);
    }
    Ok(proof)
}

/// The staked coin must sit at least `stake_min_confirmations - 1` blocks below
/// the block being validated.
pub fn check_stake_depth(
    prev_height: u32,
    coin_height: u32,
    params: &ConsensusParams,
) -> Result<(), PosError> {
    let required = params.stake_min_confirmations.saturating_sub(1);
    let depth = i64::from(prev_height) - i64::from(coin_height);
    if depth < i64::from(required) {
        return Err(PosError::InvalidStakeDepth);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_consensus::money::COIN;
    use hybridd_consensus::{consensus_params, Network};

    #[test]
    fn kernel_is_deterministic_and_field_sensitive() {
        let prevout = OutPoint::new([5; 32], 1);
        let base = stake_kernel_hash(&[9; 32], 1_000, &prevout, 2_000);
        assert_eq!(base, stake_kernel_hash(&[9; 32], 1_000, &prevout, 2_000));
        assert_ne!(base, stake_kernel_hash(&[8; 32], 1_000, &prevout, 2_000));
        assert_ne!(base, stake_kernel_hash(&[9; 32], 1_001, &prevout, 2_000));
        assert_ne!(
            base,
            stake_kernel_hash(&[9; 32], 1_000, &OutPoint::new([5; 32], 2), 2_000)
        );
        assert_ne!(base, stake_kernel_hash(&[9; 32], 1_000, &prevout, 2_016));
    }

    #[test]
    fn easy_target_passes_and_returns_proof() {
        let prevout = OutPoint::new([1; 32], 0);
        let proof = check_stake_kernel_hash(&[0; 32], 100, &prevout, 200, 0x207f_ffff, COIN)
            .expect("kernel");
        assert_eq!(proof, stake_kernel_hash(&[0; 32], 100, &prevout, 200));
    }

    #[test]
    fn zero_weight_misses_target() {
        let prevout = OutPoint::new([1; 32], 0);
        assert_eq!(
            check_stake_kernel_hash(&[0; 32], 100, &prevout, 200, 0x207f_ffff, 0),
            Err(PosError::StakeHashInvalidTarget)
        );
    }

    #[test]
    fn coinstake_before_coin_is_a_time_violation() {
        let prevout = OutPoint::new([1; 32], 0);
        assert_eq!(
            check_stake_kernel_hash(&[0; 32], 300, &prevout, 200, 0x207f_ffff, COIN),
            Err(PosError::StakeTimeViolation)
        );
    }

    #[test]
    fn stake_depth_boundary() {
        let params = consensus_params(Network::PosRegtest);
        let min = params.stake_min_confirmations;
        assert_eq!(check_stake_depth(100, 100 - (min - 1), &params), Ok(()));
        assert_eq!(
            check_stake_depth(100, 100 - (min - 2), &params),
            Err(PosError::InvalidStakeDepth)
        );
        assert_eq!(
            check_stake_depth(5, 9, &params),
            Err(PosError::InvalidStakeDepth)
        );
    }
}
