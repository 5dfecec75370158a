//! Stake block shape and block signature checks.

use std::sync::OnceLock;

use hybridd_consensus::constants::WITNESS_COMMITMENT_HEADER;
use hybridd_consensus::ConsensusParams;
use hybridd_primitives::block::Block;
use hybridd_primitives::transaction::TxOut;
use hybridd_script::standard::p2pk_pubkey;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

use crate::PosError;

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Coinbase and coinstake placement rules for blocks on a stake network.
pub fn check_block_shape(block: &Block) -> Result<(), PosError> {
    let proof_of_stake = block.is_proof_of_stake();

    if proof_of_stake {
        if let Some(coinbase) = block.transactions.first() {
            if !coinbase.vout.iter().all(is_empty_or_commitment) {
                return Err(PosError::CoinbaseNotEmpty);
            }
        }
    }

    let first_coinstake = usize::from(proof_of_stake) + 1;
    let extra = block
        .transactions
        .iter()
        .skip(first_coinstake)
        .any(|tx| tx.is_coinstake());
    match (proof_of_stake, extra) {
        (_, false) => Ok(()),
        (true, true) => Err(PosError::MultipleCoinstake),
        (false, true) => Err(PosError::CoinstakeInPowBlock),
    }
}

fn is_empty_or_commitment(output: &TxOut) -> bool {
    output.is_empty()
        || (output.value == 0 && output.script_pubkey.starts_with(&WITNESS_COMMITMENT_HEADER))
}

/// The coinstake must carry the header time, aligned to the stake mask.
pub fn check_coinstake_timestamp(
    block_time: u32,
    coinstake_time: u32,
    params: &ConsensusParams,
) -> Result<(), PosError> {
    if block_time != coinstake_time {
        return Err(PosError::CoinstakeTimeMismatch);
    }
    if coinstake_time & params.stake_timestamp_mask != 0 {
        return Err(PosError::BadCoinstakeTimestamp);
    }
    Ok(())
}

/// Proof-of-work blocks carry an empty signature. Proof-of-stake blocks are
/// signed over the block hash by the pay-to-pubkey key of coinstake output 1,
/// with a strict DER, low-S signature.
pub fn check_block_signature(block: &Block) -> Result<(), PosError> {
    let signature = block.signature.as_deref().unwrap_or_default();
    if !block.is_proof_of_stake() {
        if signature.is_empty() {
            return Ok(());
        }
        return Err(PosError::BadBlockSignature("pow block carries a signature"));
    }
    if signature.is_empty() {
        return Err(PosError::BadBlockSignature("stake block signature missing"));
    }

    let output = block
        .transactions
        .get(1)
        .and_then(|coinstake| coinstake.vout.get(1))
        .ok_or(PosError::BadBlockSignature("coinstake has no reward output"))?;
    let pubkey_bytes = p2pk_pubkey(&output.script_pubkey).ok_or(PosError::BadBlockSignature(
        "coinstake output is not pay-to-pubkey",
    ))?;
    let pubkey = PublicKey::from_slice(pubkey_bytes)
        .map_err(|_| PosError::BadBlockSignature("invalid coinstake pubkey"))?;

    let sig = Signature::from_der(signature)
        .map_err(|_| PosError::BadBlockSignature("non-canonical block signature"))?;
    let mut normalized = sig;
    normalized.normalize_s();
    if normalized != sig {
        return Err(PosError::BadBlockSignature("block signature has high s"));
    }

    let msg = Message::from_digest(block.hash());
    secp256k1_verify()
        .verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|_| PosError::BadBlockSignature("block signature verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_consensus::{consensus_params, Network};
    use hybridd_primitives::block::BlockHeader;
    use hybridd_primitives::outpoint::OutPoint;
    use hybridd_primitives::transaction::{Transaction, TxIn};
    use secp256k1::SecretKey;

    fn secret() -> SecretKey {
        SecretKey::from_slice(&[0x42; 32]).expect("secret")
    }

    fn p2pk(secret: &SecretKey) -> Vec<u8> {
        let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), secret);
        let mut script = vec![33];
        script.extend_from_slice(&pubkey.serialize());
        script.push(0xac);
        script
    }

    fn tx(vin: Vec<TxIn>, vout: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            time: Some(1_700_000_000),
            vin,
            vout,
            lock_time: 0,
        }
    }

    fn stake_block() -> Block {
        let coinbase = tx(
            vec![TxIn::new(OutPoint::null(), vec![0x51, 0x51], u32::MAX)],
            vec![TxOut::empty()],
        );
        let coinstake = tx(
            vec![TxIn::new(OutPoint::new([7; 32], 0), Vec::new(), u32::MAX)],
            vec![TxOut::empty(), TxOut::new(10, p2pk(&secret()))],
        );
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: [1; 32],
                merkle_root: [2; 32],
                time: 1_700_000_000,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: vec![coinbase, coinstake],
            signature: Some(Vec::new()),
        }
    }

    fn sign(block: &mut Block) {
        let msg = Message::from_digest(block.hash());
        let sig = Secp256k1::new().sign_ecdsa(&msg, &secret());
        block.signature = Some(sig.serialize_der().to_vec());
    }

    #[test]
    fn signed_stake_block_verifies() {
        let mut block = stake_block();
        sign(&mut block);
        assert_eq!(check_block_signature(&block), Ok(()));
    }

    #[test]
    fn signature_over_other_header_fails() {
        let mut block = stake_block();
        sign(&mut block);
        block.header.nonce += 1;
        assert!(matches!(
            check_block_signature(&block),
            Err(PosError::BadBlockSignature(_))
        ));
    }

    #[test]
    fn high_s_signature_is_rejected() {
        let mut block = stake_block();
        let msg = Message::from_digest(block.hash());
        let sig = Secp256k1::new().sign_ecdsa(&msg, &secret());
        let mut compact = sig.serialize_compact();
        // s' = n - s
        let order: [u8; 32] = secp256k1::constants::CURVE_ORDER;
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let value = i16::from(order[i]) - i16::from(compact[32 + i]) - borrow;
            borrow = i16::from(value < 0);
            compact[32 + i] = value.rem_euclid(256) as u8;
        }
        let high = Signature::from_compact(&compact).expect("high s");
        block.signature = Some(high.serialize_der().to_vec());
        assert_eq!(
            check_block_signature(&block),
            Err(PosError::BadBlockSignature("block signature has high s"))
        );
    }

    #[test]
    fn pow_block_must_be_unsigned() {
        let mut block = stake_block();
        block.transactions.truncate(1);
        assert_eq!(check_block_signature(&block), Ok(()));
        block.signature = Some(vec![0x30]);
        assert!(check_block_signature(&block).is_err());
    }

    #[test]
    fn stake_coinbase_must_be_empty() {
        let mut block = stake_block();
        assert_eq!(check_block_shape(&block), Ok(()));
        block.transactions[0].vout[0] = TxOut::new(1, vec![0x51]);
        assert_eq!(check_block_shape(&block), Err(PosError::CoinbaseNotEmpty));
    }

    #[test]
    fn coinstake_placement() {
        let mut block = stake_block();
        let extra = block.transactions[1].clone();
        block.transactions.push(extra.clone());
        assert_eq!(check_block_shape(&block), Err(PosError::MultipleCoinstake));

        block.transactions.remove(1);
        block.transactions[0].vout[0] = TxOut::new(50, vec![0x51]);
        block.transactions.insert(
            1,
            tx(
                vec![TxIn::new(OutPoint::new([3; 32], 0), Vec::new(), u32::MAX)],
                vec![TxOut::new(1, vec![0x51])],
            ),
        );
        assert_eq!(check_block_shape(&block), Err(PosError::CoinstakeInPowBlock));
    }

    #[test]
    fn coinstake_time_alignment() {
        let params = consensus_params(Network::PosMainnet);
        assert_eq!(check_coinstake_timestamp(1_600, 1_600, &params), Ok(()));
        assert_eq!(
            check_coinstake_timestamp(1_600, 1_616, &params),
            Err(PosError::CoinstakeTimeMismatch)
        );
        assert_eq!(
            check_coinstake_timestamp(1_601, 1_601, &params),
            Err(PosError::BadCoinstakeTimestamp)
        );
    }
}
