use hybridd_primitives::outpoint::OutPoint;
use hybridd_primitives::transaction::{Transaction, TxIn, TxOut};
use hybridd_script::sighash::{
    signature_hash, SigVersion, SighashError, SighashType, SIGHASH_ALL, SIGHASH_ANYONECANPAY,
    SIGHASH_NONE, SIGHASH_SINGLE,
};

fn spend(time: Option<u32>) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![
            TxIn::new(OutPoint::new([1; 32], 0), Vec::new(), u32::MAX),
            TxIn::new(OutPoint::new([2; 32], 1), Vec::new(), u32::MAX),
        ],
        vout: vec![TxOut::new(5_000, vec![0x51])],
        lock_time: 0,
    }
}

fn digest(tx: &Transaction, input: usize, kind: u32, version: SigVersion) -> [u8; 32] {
    signature_hash(tx, input, &[0x51], 10_000, SighashType(kind), version, None)
        .expect("sighash")
}

#[test]
fn sighash_type_flags() {
    let combined = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
    assert_eq!(combined.base_type(), SIGHASH_ALL);
    assert!(combined.has_anyone_can_pay());
    assert!(!SighashType(SIGHASH_NONE).has_anyone_can_pay());
}

#[test]
fn transaction_time_is_committed_to() {
    for version in [SigVersion::Base, SigVersion::WitnessV0] {
        let early = digest(&spend(Some(100)), 0, SIGHASH_ALL, version);
        let late = digest(&spend(Some(101)), 0, SIGHASH_ALL, version);
        let untimed = digest(&spend(None), 0, SIGHASH_ALL, version);
        assert_ne!(early, late);
        assert_ne!(early, untimed);
    }
}

#[test]
fn single_without_matching_output_signs_one() {
    let tx = spend(None);
    let mut one = [0u8; 32];
    one[0] = 1;
    assert_eq!(digest(&tx, 1, SIGHASH_SINGLE, SigVersion::Base), one);
    assert_ne!(digest(&tx, 0, SIGHASH_SINGLE, SigVersion::Base), one);
}

#[test]
fn input_index_is_bounds_checked() {
    let tx = spend(None);
    assert_eq!(
        signature_hash(
            &tx,
            2,
            &[],
            0,
            SighashType(SIGHASH_ALL),
            SigVersion::Base,
            None
        ),
        Err(SighashError::InputIndexOutOfRange)
    );
}
