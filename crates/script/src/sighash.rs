//! Signature hashing for legacy and witness v0 inputs.

use hybridd_consensus::money::Amount;
use hybridd_consensus::Hash256;
use hybridd_primitives::encoding::{Encodable, Encoder};
use hybridd_primitives::hash::sha256d;
use hybridd_primitives::transaction::Transaction;

use crate::opcodes::{Instructions, OP_CODESEPARATOR};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigVersion {
    Base,
    WitnessV0,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Legacy `SIGHASH_SINGLE` without a matching output signs the number one.
const SIGHASH_SINGLE_BUG: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

/// BIP143 digests shared by every input of a transaction.
#[derive(Clone, Debug)]
pub struct PrecomputedTransactionData {
    hash_prevouts: Hash256,
    hash_sequence: Hash256,
    hash_outputs: Hash256,
}

impl PrecomputedTransactionData {
    pub fn new(tx: &Transaction) -> Self {
        let mut prevouts = Encoder::with_capacity(tx.vin.len() * 36);
        let mut sequences = Encoder::with_capacity(tx.vin.len() * 4);
        for input in &tx.vin {
            input.prevout.consensus_encode(&mut prevouts);
            sequences.write_u32_le(input.sequence);
        }
        let mut outputs = Encoder::new();
        for output in &tx.vout {
            output.consensus_encode(&mut outputs);
        }
        Self {
            hash_prevouts: sha256d(&prevouts.into_inner()),
            hash_sequence: sha256d(&sequences.into_inner()),
            hash_outputs: sha256d(&outputs.into_inner()),
        }
    }
}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
    sighash_type: SighashType,
    sigversion: SigVersion,
    precomputed: Option<&PrecomputedTransactionData>,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    match sigversion {
        SigVersion::Base => Ok(signature_hash_legacy(
            tx,
            input_index,
            script_code,
            sighash_type,
        )),
        SigVersion::WitnessV0 => {
            let owned;
            let precomputed = match precomputed {
                Some(data) => data,
                None => {
                    owned = PrecomputedTransactionData::new(tx);
                    &owned
                }
            };
            Ok(signature_hash_witness_v0(
                tx,
                input_index,
                script_code,
                amount,
                sighash_type,
                precomputed,
            ))
        }
    }
}

fn signature_hash_legacy(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return SIGHASH_SINGLE_BUG;
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let script_code = strip_code_separators(script_code);

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    if let Some(time) = tx.time {
        encoder.write_u32_le(time);
    }

    let input_count = if anyone_can_pay { 1 } else { tx.vin.len() };
    encoder.write_varint(input_count as u64);
    for idx in 0..input_count {
        let actual_index = if anyone_can_pay { input_index } else { idx };
        let input = &tx.vin[actual_index];
        input.prevout.consensus_encode(&mut encoder);
        let is_signing = actual_index == input_index;
        if is_signing {
            encoder.write_var_bytes(&script_code);
        } else {
            encoder.write_varint(0);
        }

        if !is_signing && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_varint(output_count as u64);
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            encoder.write_i64_le(-1);
            encoder.write_varint(0);
        } else {
            tx.vout[idx].consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

fn signature_hash_witness_v0(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
    sighash_type: SighashType,
    precomputed: &PrecomputedTransactionData,
) -> Hash256 {
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let base = sighash_type.base_type();

    let hash_prevouts = if !anyone_can_pay {
        precomputed.hash_prevouts
    } else {
        [0u8; 32]
    };
    let hash_sequence = if !anyone_can_pay && base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        precomputed.hash_sequence
    } else {
        [0u8; 32]
    };
    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        precomputed.hash_outputs
    } else if base == SIGHASH_SINGLE && input_index < tx.vout.len() {
        let mut encoder = Encoder::new();
        tx.vout[input_index].consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    } else {
        [0u8; 32]
    };

    let input = &tx.vin[input_index];
    let mut encoder = Encoder::with_capacity(160 + script_code.len());
    encoder.write_i32_le(tx.version);
    if let Some(time) = tx.time {
        encoder.write_u32_le(time);
    }
    encoder.write_hash(&hash_prevouts);
    encoder.write_hash(&hash_sequence);
    input.prevout.consensus_encode(&mut encoder);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(amount);
    encoder.write_u32_le(input.sequence);
    encoder.write_hash(&hash_outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut instructions = Instructions::new(script);
    let mut start = instructions.position();
    while let Some(instruction) = instructions.next() {
        let end = instructions.position();
        match instruction {
            Ok(instruction) if instruction.opcode == OP_CODESEPARATOR => {}
            Ok(_) => out.extend_from_slice(&script[start..end]),
            Err(()) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_primitives::outpoint::OutPoint;
    use hybridd_primitives::transaction::{TxIn, TxOut};

    fn two_in_one_out() -> Transaction {
        Transaction {
            version: 2,
            time: None,
            vin: vec![
                TxIn::new(OutPoint::new([1; 32], 0), Vec::new(), u32::MAX),
                TxIn::new(OutPoint::new([2; 32], 1), Vec::new(), u32::MAX),
            ],
            vout: vec![TxOut::new(500, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn single_without_output_signs_one() {
        let tx = two_in_one_out();
        let hash = signature_hash(
            &tx,
            1,
            &[0x51],
            0,
            SighashType(SIGHASH_SINGLE),
            SigVersion::Base,
            None,
        )
        .expect("hash");
        assert_eq!(hash, SIGHASH_SINGLE_BUG);
    }

    #[test]
    fn code_separators_do_not_change_legacy_hash() {
        let tx = two_in_one_out();
        let plain = signature_hash(
            &tx,
            0,
            &[0x76, 0xac],
            0,
            SighashType(SIGHASH_ALL),
            SigVersion::Base,
            None,
        )
        .expect("hash");
        let separated = signature_hash(
            &tx,
            0,
            &[0x76, OP_CODESEPARATOR, 0xac],
            0,
            SighashType(SIGHASH_ALL),
            SigVersion::Base,
            None,
        )
        .expect("hash");
        assert_eq!(plain, separated);
    }

    #[test]
    fn witness_hash_commits_to_amount() {
        let tx = two_in_one_out();
        let cache = PrecomputedTransactionData::new(&tx);
        let sign = |amount| {
            signature_hash(
                &tx,
                0,
                &[0x51],
                amount,
                SighashType(SIGHASH_ALL),
                SigVersion::WitnessV0,
                Some(&cache),
            )
            .expect("hash")
        };
        assert_ne!(sign(1_000), sign(1_001));
        assert_eq!(
            sign(1_000),
            signature_hash(
                &tx,
                0,
                &[0x51],
                1_000,
                SighashType(SIGHASH_ALL),
                SigVersion::WitnessV0,
                None,
            )
            .expect("hash")
        );
    }

    #[test]
    fn out_of_range_input_is_an_error() {
        let tx = two_in_one_out();
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
}
