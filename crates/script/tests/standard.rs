use hybridd_script::standard::{
    classify_script_pubkey, p2pk_pubkey, p2pk_script, p2pkh_script, witness_program, ScriptType,
};

#[test]
fn classify_p2pkh() {
    let script = p2pkh_script(&[0x11; 20]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pkh);
}

#[test]
fn classify_p2sh() {
    let mut script = vec![0xa9, 0x14];
    script.extend_from_slice(&[0x22; 20]);
    script.push(0x87);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Sh);
}

#[test]
fn classify_witness_programs() {
    let mut p2wpkh = vec![0x00, 0x14];
    p2wpkh.extend_from_slice(&[0x33; 20]);
    assert_eq!(classify_script_pubkey(&p2wpkh), ScriptType::P2Wpkh);
    assert_eq!(witness_program(&p2wpkh), Some((0, &[0x33u8; 20][..])));

    let mut p2wsh = vec![0x00, 0x20];
    p2wsh.extend_from_slice(&[0x44; 32]);
    assert_eq!(classify_script_pubkey(&p2wsh), ScriptType::P2Wsh);

    let mut future = vec![0x51, 0x02];
    future.extend_from_slice(&[0x55; 2]);
    assert_eq!(witness_program(&future), Some((1, &[0x55u8; 2][..])));
}

#[test]
fn classify_p2pk_and_extract_key() {
    let script = p2pk_script(&[0x02; 33]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pk);
    assert_eq!(p2pk_pubkey(&script), Some(&[0x02u8; 33][..]));
}

#[test]
fn classify_unknown() {
    let script = vec![0x6a, 0x01, 0x01];
    assert_eq!(classify_script_pubkey(&script), ScriptType::Unknown);
    assert_eq!(witness_program(&script), None);
}
