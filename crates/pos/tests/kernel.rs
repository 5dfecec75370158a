use hybridd_consensus::{consensus_params, Network};
use hybridd_pos::{
    check_stake_depth, check_stake_kernel_hash, compute_stake_modifier_v2, stake_kernel_hash,
    PosError,
};
use hybridd_primitives::outpoint::OutPoint;

// Target of exactly 2^210.
const TIGHT_BITS: u32 = 0x1b04_0000;

#[test]
fn kernel_hash_is_a_pure_function_of_its_inputs() {
    let prevout = OutPoint::new([0x11; 32], 3);
    let modifier = [0x22; 32];
    let first = stake_kernel_hash(&modifier, 5_000, &prevout, 6_000);
    for _ in 0..4 {
        assert_eq!(stake_kernel_hash(&modifier, 5_000, &prevout, 6_000), first);
    }
    assert_ne!(stake_kernel_hash(&[0x23; 32], 5_000, &prevout, 6_000), first);
    assert_ne!(stake_kernel_hash(&modifier, 5_001, &prevout, 6_000), first);
    assert_ne!(
        stake_kernel_hash(&modifier, 5_000, &OutPoint::new([0x11; 32], 4), 6_000),
        first
    );
    assert_ne!(stake_kernel_hash(&modifier, 5_000, &prevout, 6_016), first);
}

#[test]
fn staked_value_weights_the_target() {
    let prevout = OutPoint::new([0x33; 32], 0);
    let modifier = [0x44; 32];
    assert_eq!(
        check_stake_kernel_hash(&modifier, 1_000, &prevout, 2_000, TIGHT_BITS, 1),
        Err(PosError::StakeHashInvalidTarget)
    );
    let proof = check_stake_kernel_hash(&modifier, 1_000, &prevout, 2_000, TIGHT_BITS, 1 << 50)
        .expect("heavy stake meets the weighted target");
    assert_eq!(proof, stake_kernel_hash(&modifier, 1_000, &prevout, 2_000));
}

#[test]
fn coinstake_cannot_predate_its_coin() {
    let prevout = OutPoint::new([0x55; 32], 1);
    assert_eq!(
        check_stake_kernel_hash(&[0; 32], 2_000, &prevout, 1_999, 0x207f_ffff, 1 << 40),
        Err(PosError::StakeTimeViolation)
    );
}

#[test]
fn depth_boundary_follows_min_confirmations() {
    let params = consensus_params(Network::PosRegtest);
    let required = params.stake_min_confirmations - 1;
    assert_eq!(check_stake_depth(100 + required, 100, &params), Ok(()));
    assert_eq!(
        check_stake_depth(100 + required - 1, 100, &params),
        Err(PosError::InvalidStakeDepth)
    );
}

#[test]
fn modifiers_chain_from_the_selector() {
    let genesis = compute_stake_modifier_v2(None, &[9; 32]);
    assert_eq!(genesis, [0; 32]);
    let first = compute_stake_modifier_v2(Some(&genesis), &[1; 32]);
    let second = compute_stake_modifier_v2(Some(&first), &[1; 32]);
    assert_ne!(first, genesis);
    assert_ne!(second, first);
    assert_eq!(compute_stake_modifier_v2(Some(&first), &[1; 32]), second);
}
