//! Script interpreter and validation.

use hybridd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_SCRIPT_SIZE, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use hybridd_consensus::money::Amount;
use hybridd_primitives::hash::{hash160, sha256, sha256d};
use hybridd_primitives::transaction::Transaction;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey};
use sha1::Sha1;

use crate::opcodes::*;
use crate::secp::secp256k1_verify;
use crate::sighash::{
    signature_hash, PrecomputedTransactionData, SigVersion, SighashType, SIGHASH_ALL,
    SIGHASH_ANYONECANPAY, SIGHASH_SINGLE,
};
use crate::standard::{is_p2sh, witness_program};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;
pub const SCRIPT_VERIFY_WITNESS: ScriptFlags = 1 << 11;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM: ScriptFlags = 1 << 12;

const STRICT_DER_FLAGS: ScriptFlags =
    SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC;

pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
pub const MAX_STACK_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    StackUnderflow,
    EvalFalse,
    InvalidOpcode,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    PubkeyCount,
    SigCount,
    NumOverflow,
    SigEncoding,
    PubkeyEncoding,
    SigHashType,
    SigCheck,
    SigPushOnly,
    NullDummy,
    NegativeLockTime,
    UnsatisfiedLockTime,
    MinimalData,
    UnbalancedConditional,
    DiscourageUpgradableNops,
    WitnessProgramWrongLength,
    WitnessProgramWitnessEmpty,
    WitnessProgramMismatch,
    WitnessMalleated,
    WitnessMalleatedP2sh,
    WitnessUnexpected,
    DiscourageUpgradableWitnessProgram,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ScriptError::StackUnderflow => "script stack underflow",
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::InvalidOpcode => "invalid opcode",
            ScriptError::OpReturn => "OP_RETURN encountered",
            ScriptError::ScriptSize => "script too large",
            ScriptError::PushSize => "push exceeds element size limit",
            ScriptError::OpCount => "opcode count exceeded",
            ScriptError::StackSize => "stack size exceeded",
            ScriptError::PubkeyCount => "multisig pubkey count out of range",
            ScriptError::SigCount => "multisig signature count out of range",
            ScriptError::NumOverflow => "script number overflow",
            ScriptError::SigEncoding => "invalid signature encoding",
            ScriptError::PubkeyEncoding => "invalid public key encoding",
            ScriptError::SigHashType => "invalid sighash type",
            ScriptError::SigCheck => "signature check failed",
            ScriptError::SigPushOnly => "scriptSig is not push-only",
            ScriptError::NullDummy => "null dummy element required",
            ScriptError::NegativeLockTime => "negative locktime",
            ScriptError::UnsatisfiedLockTime => "locktime requirement not satisfied",
            ScriptError::MinimalData => "non-minimal push",
            ScriptError::UnbalancedConditional => "unbalanced conditional",
            ScriptError::DiscourageUpgradableNops => "upgradable nop used",
            ScriptError::WitnessProgramWrongLength => "witness program has wrong length",
            ScriptError::WitnessProgramWitnessEmpty => "witness program with empty witness",
            ScriptError::WitnessProgramMismatch => "witness program hash mismatch",
            ScriptError::WitnessMalleated => "witness requires empty scriptSig",
            ScriptError::WitnessMalleatedP2sh => "witness requires only-redeemscript scriptSig",
            ScriptError::WitnessUnexpected => "witness provided for non-witness script",
            ScriptError::DiscourageUpgradableWitnessProgram => "upgradable witness program used",
        };
        write!(f, "{message}")
    }
}

impl std::error::Error for ScriptError {}

/// Signature and timelock checks against the spending transaction.
pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: Amount,
    precomputed: Option<&'a PrecomputedTransactionData>,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(
        tx: &'a Transaction,
        input_index: usize,
        amount: Amount,
        precomputed: Option<&'a PrecomputedTransactionData>,
    ) -> Self {
        Self {
            tx,
            input_index,
            amount,
            precomputed,
        }
    }

    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
        sigversion: SigVersion,
        flags: ScriptFlags,
    ) -> Result<bool, ScriptError> {
        check_signature_encoding(sig_bytes, flags)?;
        check_pubkey_encoding(pubkey_bytes, flags)?;
        if sig_bytes.is_empty() {
            return Ok(false);
        }

        let sighash_type = u32::from(sig_bytes[sig_bytes.len() - 1]);
        let der = &sig_bytes[..sig_bytes.len() - 1];
        let parsed = if flags & STRICT_DER_FLAGS != 0 {
            Signature::from_der(der)
        } else {
            Signature::from_der_lax(der)
        };
        let Ok(mut sig) = parsed else {
            return Ok(false);
        };
        // libsecp256k1 only verifies lower-S signatures.
        sig.normalize_s();

        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return Ok(false);
        };
        let sighash = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            self.amount,
            SighashType(sighash_type),
            sigversion,
            self.precomputed,
        )
        .map_err(|_| ScriptError::SigCheck)?;

        let msg = Message::from_digest(sighash);
        Ok(secp256k1_verify().verify_ecdsa(&msg, &sig, &pubkey).is_ok())
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let threshold = i64::from(LOCKTIME_THRESHOLD);
        let tx_lock_time = i64::from(self.tx.lock_time);
        if (tx_lock_time < threshold) != (lock_time < threshold) {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        self.tx.vin[self.input_index].sequence != u32::MAX
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let tx_sequence = i64::from(self.tx.vin[self.input_index].sequence);
        if self.tx.version < 2 {
            return false;
        }
        if tx_sequence & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0 {
            return false;
        }

        let mask = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK);
        let type_flag = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG);
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        if (tx_masked < type_flag) != (masked < type_flag) {
            return false;
        }
        masked <= tx_masked
    }
}

/// Verifies one input: scriptSig, scriptPubKey, then P2SH and witness programs.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(script_sig, &mut stack, flags, checker, SigVersion::Base)?;
    let stack_copy = if (flags & SCRIPT_VERIFY_P2SH) != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(script_pubkey, &mut stack, flags, checker, SigVersion::Base)?;
    if !top_is_true(&stack) {
        return Err(ScriptError::EvalFalse);
    }

    let mut had_witness = false;
    if (flags & SCRIPT_VERIFY_WITNESS) != 0 {
        if let Some((version, program)) = witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            verify_witness_program(witness, version, program, flags, checker)?;
            stack.truncate(1);
        }
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        eval_script(&redeem_script, &mut stack, flags, checker, SigVersion::Base)?;
        if !top_is_true(&stack) {
            return Err(ScriptError::EvalFalse);
        }

        if (flags & SCRIPT_VERIFY_WITNESS) != 0 {
            if let Some((version, program)) = witness_program(&redeem_script) {
                had_witness = true;
                let mut expected = Vec::with_capacity(redeem_script.len() + 3);
                push_data(&mut expected, &redeem_script);
                if script_sig != expected.as_slice() {
                    return Err(ScriptError::WitnessMalleatedP2sh);
                }
                verify_witness_program(witness, version, program, flags, checker)?;
                stack.truncate(1);
            }
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::EvalFalse);
    }

    if (flags & SCRIPT_VERIFY_WITNESS) != 0 && !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }
    Ok(())
}

fn verify_witness_program(
    witness: &[Vec<u8>],
    version: u8,
    program: &[u8],
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if version != 0 {
        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM) != 0 {
            return Err(ScriptError::DiscourageUpgradableWitnessProgram);
        }
        return Ok(());
    }

    let (script, mut stack) = match program.len() {
        32 => {
            let (script, rest) = witness
                .split_last()
                .ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
            if sha256(script)[..] != *program {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            (script.clone(), rest.to_vec())
        }
        20 => {
            if witness.len() != 2 {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let mut script = vec![OP_DUP, OP_HASH160, 0x14];
            script.extend_from_slice(program);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            (script, witness.to_vec())
        }
        _ => return Err(ScriptError::WitnessProgramWrongLength),
    };

    if stack.iter().any(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
        return Err(ScriptError::PushSize);
    }
    eval_script(&script, &mut stack, flags, checker, SigVersion::WitnessV0)?;
    if stack.len() != 1 || !cast_to_bool(&stack[0]) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}

pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
    sigversion: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;
    let mut instructions = Instructions::new(script);
    let mut code_start = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;

    while let Some(instruction) = instructions.next() {
        let instruction = instruction.map_err(|()| ScriptError::StackUnderflow)?;
        let opcode = instruction.opcode;
        let exec = exec_stack.iter().all(|v| *v);

        if let Some(data) = instruction.data {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            if exec {
                if minimal && !check_minimal_push(data, opcode) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
            check_stack_size(stack)?;
            continue;
        }

        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }

        match opcode {
            OP_IF | OP_NOTIF => {
                let branch = if exec {
                    let value = cast_to_bool(&pop(stack)?);
                    if opcode == OP_NOTIF {
                        !value
                    } else {
                        value
                    }
                } else {
                    false
                };
                exec_stack.push(branch);
            }
            OP_ELSE => {
                let current = exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *current = !*current;
            }
            OP_ENDIF => {
                exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }
            _ if !exec => {}
            OP_1NEGATE => stack.push(script_num_to_vec(-1)),
            OP_1..=OP_16 => stack.push(script_num_to_vec(i64::from(opcode - OP_1 + 1))),
            OP_NOP => {}
            OP_VERIFY => {
                if !cast_to_bool(&pop(stack)?) {
                    return Err(ScriptError::EvalFalse);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),
            OP_DUP => {
                let top = peek(stack, 1)?.clone();
                stack.push(top);
            }
            OP_2DUP => {
                let a = peek(stack, 2)?.clone();
                let b = peek(stack, 1)?.clone();
                stack.push(a);
                stack.push(b);
            }
            OP_DROP => {
                pop(stack)?;
            }
            OP_2DROP => {
                pop(stack)?;
                pop(stack)?;
            }
            OP_NIP => {
                let top = pop(stack)?;
                pop(stack)?;
                stack.push(top);
            }
            OP_OVER => {
                let second = peek(stack, 2)?.clone();
                stack.push(second);
            }
            OP_SWAP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::StackUnderflow);
                }
                stack.swap(len - 1, len - 2);
            }
            OP_DEPTH => stack.push(script_num_to_vec(stack.len() as i64)),
            OP_SIZE => {
                let len = peek(stack, 1)?.len();
                stack.push(script_num_to_vec(len as i64));
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                let a = pop(stack)?;
                let b = pop(stack)?;
                if opcode == OP_EQUALVERIFY {
                    if a != b {
                        return Err(ScriptError::EvalFalse);
                    }
                } else {
                    stack.push(bool_to_vec(a == b));
                }
            }
            OP_1ADD | OP_1SUB | OP_NOT | OP_0NOTEQUAL => {
                let value = decode_script_num(&pop(stack)?, 4, minimal)?;
                let result = match opcode {
                    OP_1ADD => value + 1,
                    OP_1SUB => value - 1,
                    OP_NOT => i64::from(value == 0),
                    _ => i64::from(value != 0),
                };
                stack.push(script_num_to_vec(result));
            }
            OP_ADD | OP_SUB | OP_NUMEQUAL | OP_NUMEQUALVERIFY | OP_LESSTHAN | OP_GREATERTHAN => {
                let b = decode_script_num(&pop(stack)?, 4, minimal)?;
                let a = decode_script_num(&pop(stack)?, 4, minimal)?;
                let result = match opcode {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_LESSTHAN => i64::from(a < b),
                    OP_GREATERTHAN => i64::from(a > b),
                    _ => i64::from(a == b),
                };
                if opcode == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::EvalFalse);
                    }
                } else {
                    stack.push(script_num_to_vec(result));
                }
            }
            OP_WITHIN => {
                let max = decode_script_num(&pop(stack)?, 4, minimal)?;
                let min = decode_script_num(&pop(stack)?, 4, minimal)?;
                let value = decode_script_num(&pop(stack)?, 4, minimal)?;
                stack.push(bool_to_vec(min <= value && value < max));
            }
            OP_RIPEMD160 => {
                let data = pop(stack)?;
                let mut hasher = Ripemd160::new();
                hasher.update(data);
                stack.push(hasher.finalize().to_vec());
            }
            OP_SHA1 => {
                let data = pop(stack)?;
                let mut hasher = Sha1::new();
                hasher.update(data);
                stack.push(hasher.finalize().to_vec());
            }
            OP_SHA256 => {
                let data = pop(stack)?;
                stack.push(sha256(&data).to_vec());
            }
            OP_HASH160 => {
                let data = pop(stack)?;
                stack.push(hash160(&data).to_vec());
            }
            OP_HASH256 => {
                let data = pop(stack)?;
                stack.push(sha256d(&data).to_vec());
            }
            OP_CODESEPARATOR => code_start = instructions.position(),
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = pop(stack)?;
                let sig = pop(stack)?;
                let script_code =
                    signing_script_code(&script[code_start..], &[&sig], sigversion);
                let ok = checker.check_sig(&sig, &pubkey, &script_code, sigversion, flags)?;
                if opcode == OP_CHECKSIGVERIFY {
                    if !ok {
                        return Err(ScriptError::SigCheck);
                    }
                } else {
                    stack.push(bool_to_vec(ok));
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let n = decode_script_num(&pop(stack)?, 4, minimal)?;
                if !(0..=MAX_PUBKEYS_PER_MULTISIG as i64).contains(&n) {
                    return Err(ScriptError::PubkeyCount);
                }
                op_count += n as usize;
                if op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
                let mut pubkeys = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    pubkeys.push(pop(stack)?);
                }
                pubkeys.reverse();
                let m = decode_script_num(&pop(stack)?, 4, minimal)?;
                if m < 0 || m > n {
                    return Err(ScriptError::SigCount);
                }
                let mut sigs = Vec::with_capacity(m as usize);
                for _ in 0..m {
                    sigs.push(pop(stack)?);
                }
                sigs.reverse();

                let dummy = pop(stack)?;
                if (flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
                    return Err(ScriptError::NullDummy);
                }

                let sig_refs: Vec<&[u8]> = sigs.iter().map(Vec::as_slice).collect();
                let script_code =
                    signing_script_code(&script[code_start..], &sig_refs, sigversion);
                let mut sig_index = 0usize;
                let mut key_index = 0usize;
                while sig_index < sigs.len() && key_index < pubkeys.len() {
                    let ok = checker.check_sig(
                        &sigs[sig_index],
                        &pubkeys[key_index],
                        &script_code,
                        sigversion,
                        flags,
                    )?;
                    if ok {
                        sig_index += 1;
                    }
                    key_index += 1;
                    if pubkeys.len() - key_index < sigs.len() - sig_index {
                        break;
                    }
                }

                let success = sig_index == sigs.len();
                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !success {
                        return Err(ScriptError::SigCheck);
                    }
                } else {
                    stack.push(bool_to_vec(success));
                }
            }
            OP_CHECKLOCKTIMEVERIFY => {
                if (flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) != 0 {
                    let lock_time = decode_script_num(peek(stack, 1)?, 5, minimal)?;
                    if lock_time < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    if !checker.check_lock_time(lock_time) {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                } else if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }
            OP_CHECKSEQUENCEVERIFY => {
                if (flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY) != 0 {
                    let sequence = decode_script_num(peek(stack, 1)?, 5, minimal)?;
                    if sequence < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    let disabled = sequence & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0;
                    if !disabled && !checker.check_sequence(sequence) {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                } else if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }
            OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }
            _ => {
                hybridd_log::log_trace!(
                    "invalid opcode 0x{opcode:02x} in script {}",
                    bytes_to_hex(script)
                );
                return Err(ScriptError::InvalidOpcode);
            }
        }
        check_stack_size(stack)?;
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

/// Legacy script code drops the signatures being checked; witness script code
/// is taken verbatim.
fn signing_script_code(script: &[u8], sigs: &[&[u8]], sigversion: SigVersion) -> Vec<u8> {
    if sigversion == SigVersion::WitnessV0 {
        return script.to_vec();
    }
    let mut code = script.to_vec();
    for sig in sigs {
        let mut pattern = Vec::with_capacity(sig.len() + 3);
        push_data(&mut pattern, sig);
        code = find_and_delete(&code, &pattern);
    }
    code
}

fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut instructions = Instructions::new(script);
    let mut start = instructions.position();
    while let Some(instruction) = instructions.next() {
        let end = instructions.position();
        if instruction.is_err() {
            out.extend_from_slice(&script[start..]);
            break;
        }
        if &script[start..end] != pattern {
            out.extend_from_slice(&script[start..end]);
        }
        start = end;
    }
    out
}

fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    if flags & STRICT_DER_FLAGS != 0 && !is_valid_signature_encoding(sig) {
        return Err(ScriptError::SigEncoding);
    }
    if (flags & SCRIPT_VERIFY_LOW_S) != 0 {
        let low = Signature::from_der(&sig[..sig.len() - 1])
            .map(|parsed| {
                let mut normalized = parsed;
                normalized.normalize_s();
                normalized == parsed
            })
            .unwrap_or(false);
        if !low {
            return Err(ScriptError::SigEncoding);
        }
    }
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 {
        let base = u32::from(sig[sig.len() - 1]) & !SIGHASH_ANYONECANPAY;
        if !(SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base) {
            return Err(ScriptError::SigHashType);
        }
    }
    Ok(())
}

fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 && !is_valid_pubkey(pubkey) {
        return Err(ScriptError::PubkeyEncoding);
    }
    Ok(())
}

/// BIP66 strict DER check over `sig ∥ sighash_type`.
fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::StackUnderflow)
}

/// Element `depth` from the top (1 = top).
fn peek(stack: &[Vec<u8>], depth: usize) -> Result<&Vec<u8>, ScriptError> {
    stack
        .len()
        .checked_sub(depth)
        .and_then(|index| stack.get(index))
        .ok_or(ScriptError::StackUnderflow)
}

fn check_stack_size(stack: &[Vec<u8>]) -> Result<(), ScriptError> {
    if stack.len() > MAX_STACK_SIZE {
        return Err(ScriptError::StackSize);
    }
    Ok(())
}

fn top_is_true(stack: &[Vec<u8>]) -> bool {
    stack.last().is_some_and(|top| cast_to_bool(top))
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn decode_script_num(data: &[u8], max_len: usize, minimal: bool) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::NumOverflow);
    }
    let Some(&last) = data.last() else {
        return Ok(0);
    };
    if minimal && last & 0x7f == 0 && (data.len() == 1 || data[data.len() - 2] & 0x80 == 0) {
        return Err(ScriptError::MinimalData);
    }
    let mut result: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= i64::from(*byte) << (8 * i);
    }
    if (last & 0x80) != 0 {
        let mask = !(0x80i64 << (8 * (data.len() - 1)));
        result = -(result & mask);
    }
    Ok(result)
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}

fn is_valid_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return opcode == OP_1 + (data[0] - 1);
    }
    if data.len() == 1 && data[0] == 0x81 {
        return opcode == OP_1NEGATE;
    }
    if data.len() <= 75 {
        return opcode == data.len() as u8;
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
