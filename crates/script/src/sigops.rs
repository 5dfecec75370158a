//! Signature operation counting.

use crate::interpreter::{
    ScriptFlags, MAX_PUBKEYS_PER_MULTISIG, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS,
};
use crate::opcodes::{
    decode_small_int, is_push_only, Instructions, OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY,
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_1, OP_16,
};
use crate::standard::{is_p2sh, witness_program};

/// Counts CHECKSIG-family opcodes. In `accurate` mode a multisig preceded by
/// `OP_n` counts `n` instead of the maximum.
pub fn legacy_sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = None;
    for instruction in Instructions::new(script) {
        let Ok(instruction) = instruction else {
            break;
        };
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    Some(op @ OP_1..=OP_16) if accurate => {
                        u32::from(decode_small_int(op).unwrap_or(0))
                    }
                    _ => MAX_PUBKEYS_PER_MULTISIG as u32,
                };
            }
            _ => {}
        }
        last_opcode = Some(instruction.opcode);
    }
    count
}

/// Sigops of the redeem script when `script_pubkey` is P2SH.
pub fn p2sh_sigop_count(script_sig: &[u8], script_pubkey: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) {
        return legacy_sigop_count(script_pubkey, true);
    }
    match last_push(script_sig) {
        Some(redeem_script) => legacy_sigop_count(redeem_script, true),
        None => 0,
    }
}

/// Sigops executed by a witness program, native or nested in P2SH.
pub fn witness_sigop_count(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    flags: ScriptFlags,
) -> u32 {
    if (flags & SCRIPT_VERIFY_WITNESS) == 0 {
        return 0;
    }
    if let Some((version, program)) = witness_program(script_pubkey) {
        return program_sigops(version, program, witness);
    }
    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if let Some((version, program)) = last_push(script_sig).and_then(witness_program) {
            return program_sigops(version, program, witness);
        }
    }
    0
}

fn program_sigops(version: u8, program: &[u8], witness: &[Vec<u8>]) -> u32 {
    match (version, program.len()) {
        (0, 20) => 1,
        (0, 32) => witness
            .last()
            .map_or(0, |script| legacy_sigop_count(script, true)),
        _ => 0,
    }
}

fn last_push(script_sig: &[u8]) -> Option<&[u8]> {
    if !is_push_only(script_sig) {
        return None;
    }
    Instructions::new(script_sig)
        .filter_map(Result::ok)
        .last()
        .and_then(|instruction| instruction.data)
}
