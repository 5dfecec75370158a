//! Genesis block assembly from network parameters.

use hybridd_consensus::ConsensusParams;
use hybridd_primitives::block::{Block, BlockHeader};
use hybridd_primitives::outpoint::OutPoint;
use hybridd_primitives::transaction::{Transaction, TxIn, TxOut};
use hybridd_script::opcodes::push_data;

use crate::merkle::block_merkle_root;

/// Bits pushed ahead of the message in the genesis coinbase script.
const GENESIS_SCRIPT_BITS: u32 = 0x1d00_ffff;

pub fn genesis_block(params: &ConsensusParams) -> Block {
    let genesis = &params.genesis;
    let mut script_sig = Vec::with_capacity(8 + genesis.message.len());
    push_data(&mut script_sig, &GENESIS_SCRIPT_BITS.to_le_bytes());
    push_data(&mut script_sig, &[4]);
    push_data(&mut script_sig, genesis.message.as_bytes());

    let proof_of_stake = params.is_proof_of_stake();
    let coinbase = Transaction {
        version: 1,
        time: proof_of_stake.then_some(genesis.time),
        vin: vec![TxIn::new(OutPoint::null(), script_sig, u32::MAX)],
        vout: vec![TxOut::new(genesis.reward, genesis.output_script.to_vec())],
        lock_time: 0,
    };
    let (merkle_root, _) = block_merkle_root(&[coinbase.txid()]);
    Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        },
        transactions: vec![coinbase],
        signature: proof_of_stake.then(Vec::new),
    }
}
