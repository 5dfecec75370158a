use hybridd_primitives::hash::{hash160, sha256};
use hybridd_primitives::outpoint::OutPoint;
use hybridd_primitives::transaction::{Transaction, TxIn, TxOut};
use hybridd_script::interpreter::{
    SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, SCRIPT_VERIFY_DERSIG,
    SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS,
};
use hybridd_script::opcodes::{push_data, OP_CHECKMULTISIG, OP_CHECKSEQUENCEVERIFY, OP_DROP};
use hybridd_script::sighash::{signature_hash, SIGHASH_ALL};
use hybridd_script::standard::{p2pk_script, p2pkh_script};
use hybridd_script::{
    verify_script, PrecomputedTransactionData, ScriptError, SigVersion, SighashType,
    TransactionSignatureChecker,
};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

const FLAGS: u32 = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_WITNESS;

fn key(byte: u8) -> (SecretKey, Vec<u8>) {
    let secret = SecretKey::from_slice(&[byte; 32]).expect("secret");
    let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
    (secret, public.serialize().to_vec())
}

fn spending_tx(version: i32, sequence: u32) -> Transaction {
    Transaction {
        version,
        time: None,
        vin: vec![TxIn::new(OutPoint::new([9; 32], 0), Vec::new(), sequence)],
        vout: vec![TxOut::new(90_000, vec![0x51])],
        lock_time: 0,
    }
}

fn sign(
    tx: &Transaction,
    secret: &SecretKey,
    script_code: &[u8],
    amount: i64,
    sigversion: SigVersion,
) -> Vec<u8> {
    let hash = signature_hash(
        tx,
        0,
        script_code,
        amount,
        SighashType(SIGHASH_ALL),
        sigversion,
        None,
    )
    .expect("sighash");
    let sig = Secp256k1::new().sign_ecdsa(&Message::from_digest(hash), secret);
    let mut out = sig.serialize_der().to_vec();
    out.push(SIGHASH_ALL as u8);
    out
}

fn verify(tx: &Transaction, script_pubkey: &[u8], amount: i64) -> Result<(), ScriptError> {
    let precomputed = PrecomputedTransactionData::new(tx);
    let checker = TransactionSignatureChecker::new(tx, 0, amount, Some(&precomputed));
    let input = &tx.vin[0];
    verify_script(
        &input.script_sig,
        script_pubkey,
        &input.witness,
        FLAGS,
        &checker,
    )
}

#[test]
fn p2pkh_spend() {
    let (secret, pubkey) = key(1);
    let script_pubkey = p2pkh_script(&hash160(&pubkey));
    let mut tx = spending_tx(1, u32::MAX);
    let sig = sign(&tx, &secret, &script_pubkey, 0, SigVersion::Base);
    push_data(&mut tx.vin[0].script_sig, &sig);
    push_data(&mut tx.vin[0].script_sig, &pubkey);
    assert_eq!(verify(&tx, &script_pubkey, 100_000), Ok(()));

    tx.vout[0].value += 1;
    assert_eq!(
        verify(&tx, &script_pubkey, 100_000),
        Err(ScriptError::EvalFalse)
    );
}

#[test]
fn p2pk_with_wrong_key_fails() {
    let (secret, _) = key(1);
    let (_, other) = key(2);
    let script_pubkey = p2pk_script(&other);
    let mut tx = spending_tx(1, u32::MAX);
    let sig = sign(&tx, &secret, &script_pubkey, 0, SigVersion::Base);
    push_data(&mut tx.vin[0].script_sig, &sig);
    assert_eq!(verify(&tx, &script_pubkey, 0), Err(ScriptError::EvalFalse));
}

#[test]
fn p2wpkh_spend_commits_to_amount() {
    let (secret, pubkey) = key(3);
    let hash = hash160(&pubkey);
    let mut script_pubkey = vec![0x00, 0x14];
    script_pubkey.extend_from_slice(&hash);

    let mut tx = spending_tx(2, u32::MAX);
    let script_code = p2pkh_script(&hash);
    let sig = sign(&tx, &secret, &script_code, 50_000, SigVersion::WitnessV0);
    tx.vin[0].witness = vec![sig, pubkey];

    assert_eq!(verify(&tx, &script_pubkey, 50_000), Ok(()));
    assert_eq!(
        verify(&tx, &script_pubkey, 50_001),
        Err(ScriptError::EvalFalse)
    );
}

#[test]
fn witness_on_legacy_output_is_unexpected() {
    let script_pubkey = vec![0x51];
    let mut tx = spending_tx(1, u32::MAX);
    tx.vin[0].witness = vec![vec![1]];
    assert_eq!(
        verify(&tx, &script_pubkey, 0),
        Err(ScriptError::WitnessUnexpected)
    );
}

#[test]
fn p2sh_two_of_two_multisig() {
    let (first_secret, first) = key(4);
    let (second_secret, second) = key(5);
    let mut redeem = vec![0x52];
    push_data(&mut redeem, &first);
    push_data(&mut redeem, &second);
    redeem.extend_from_slice(&[0x52, OP_CHECKMULTISIG]);

    let mut script_pubkey = vec![0xa9, 0x14];
    script_pubkey.extend_from_slice(&hash160(&redeem));
    script_pubkey.push(0x87);

    let mut tx = spending_tx(1, u32::MAX);
    let sig_a = sign(&tx, &first_secret, &redeem, 0, SigVersion::Base);
    let sig_b = sign(&tx, &second_secret, &redeem, 0, SigVersion::Base);
    let mut script_sig = vec![0x00];
    push_data(&mut script_sig, &sig_a);
    push_data(&mut script_sig, &sig_b);
    push_data(&mut script_sig, &redeem);
    tx.vin[0].script_sig = script_sig;
    assert_eq!(verify(&tx, &script_pubkey, 0), Ok(()));

    // Signatures out of key order do not satisfy the multisig.
    let mut swapped = vec![0x00];
    push_data(&mut swapped, &sig_b);
    push_data(&mut swapped, &sig_a);
    push_data(&mut swapped, &redeem);
    tx.vin[0].script_sig = swapped;
    assert_eq!(verify(&tx, &script_pubkey, 0), Err(ScriptError::EvalFalse));
}

#[test]
fn p2wsh_relative_timelock() {
    let mut witness_script = Vec::new();
    push_data(&mut witness_script, &[10]);
    witness_script.extend_from_slice(&[OP_CHECKSEQUENCEVERIFY, OP_DROP, 0x51]);
    let mut script_pubkey = vec![0x00, 0x20];
    script_pubkey.extend_from_slice(&sha256(&witness_script));

    let mut tx = spending_tx(2, 10);
    tx.vin[0].witness = vec![witness_script.clone()];
    assert_eq!(verify(&tx, &script_pubkey, 0), Ok(()));

    tx.vin[0].sequence = 9;
    assert_eq!(
        verify(&tx, &script_pubkey, 0),
        Err(ScriptError::UnsatisfiedLockTime)
    );

    tx.vin[0].sequence = 10;
    tx.version = 1;
    assert_eq!(
        verify(&tx, &script_pubkey, 0),
        Err(ScriptError::UnsatisfiedLockTime)
    );
}
