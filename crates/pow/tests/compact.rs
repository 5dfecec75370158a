use hybridd_consensus::{consensus_params, Network};
use hybridd_pow::difficulty::{
    block_proof, compact_to_u256, hash_meets_target, next_work_required, u256_to_compact,
    HeaderInfo,
};
use primitive_types::U256;

#[test]
fn compact_round_trips_canonical_bits() {
    for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1b04_04cb, 0x1e0f_ffff] {
        let target = compact_to_u256(bits).expect("target");
        assert_eq!(u256_to_compact(target), bits);
    }
}

#[test]
fn regtest_limit_layout() {
    let target = compact_to_u256(0x207f_ffff).expect("target");
    let bytes = target.to_little_endian();
    assert!(bytes[..29].iter().all(|b| *b == 0));
    assert_eq!(&bytes[29..], &[0xff, 0xff, 0x7f]);
}

#[test]
fn hash_comparison_is_little_endian() {
    let target = compact_to_u256(0x2000_ffff).expect("target");
    let mut low = [0xffu8; 32];
    low[31] = 0x00;
    low[30] = 0x00;
    assert!(hash_meets_target(&low, &target));
    let high = [0xffu8; 32];
    assert!(!hash_meets_target(&high, &target));
}

#[test]
fn easier_targets_prove_less_work() {
    let hard = block_proof(0x1d00_ffff).expect("proof");
    let easy = block_proof(0x207f_ffff).expect("proof");
    assert!(hard > easy);
    assert_eq!(easy, U256::from(2u64));
}

#[test]
fn retarget_only_at_interval_boundaries() {
    let params = consensus_params(Network::PowMainnet);
    let interval = params.difficulty_adjustment_interval();
    let prev = HeaderInfo {
        height: interval - 3,
        time: 1_000_000,
        bits: 0x1c0f_ffff,
    };
    let bits = next_work_required(&prev, |_| None, &params).expect("bits");
    assert_eq!(bits, prev.bits);
}

#[test]
fn retarget_halves_target_when_blocks_come_twice_as_fast() {
    let params = consensus_params(Network::PowMainnet);
    let interval = params.difficulty_adjustment_interval();
    let first_time = 1_000_000u32;
    let prev = HeaderInfo {
        height: interval - 1,
        time: first_time + params.pow_target_timespan / 2,
        bits: 0x1c0f_fff0,
    };
    let bits = next_work_required(
        &prev,
        |height| {
            (height == 0).then_some(HeaderInfo {
                height: 0,
                time: first_time,
                bits: 0x1c0f_fff0,
            })
        },
        &params,
    )
    .expect("bits");
    let old = compact_to_u256(0x1c0f_fff0).expect("old");
    let new = compact_to_u256(bits).expect("new");
    assert_eq!(new, old / 2);
}
