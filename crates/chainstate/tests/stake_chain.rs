use std::sync::Arc;

use hybridd_chainstate::coins::KvCoinStore;
use hybridd_chainstate::engine::{ConsensusRuleEngine, EngineConfig};
use hybridd_chainstate::errors::ErrorCode;
use hybridd_chainstate::ibd::FixedTimeProvider;
use hybridd_chainstate::merkle::block_merkle_root;
use hybridd_chainstate::stake::{KvStakeStore, STAKE_FLAG_MODIFIER, STAKE_FLAG_PROOF_OF_STAKE};
use hybridd_chainstate::validator::coinbase_height_script;
use hybridd_chainstate::{BlockStake, ConsensusError, ValidationContext};
use hybridd_consensus::money::{Amount, COIN};
use hybridd_consensus::{
    consensus_params, proof_of_work_subsidy, CheckpointTable, ConsensusParams, Hash256, Network,
};
use hybridd_pos::compute_stake_modifier_v2;
use hybridd_pow::check_proof_of_work;
use hybridd_primitives::block::{Block, BlockHeader};
use hybridd_primitives::outpoint::OutPoint;
use hybridd_primitives::transaction::{Transaction, TxIn, TxOut};
use hybridd_script::opcodes::push_data;
use hybridd_script::sighash::{signature_hash, SigVersion, SighashType, SIGHASH_ALL};
use hybridd_script::standard::p2pk_script;
use hybridd_storage::memory::MemoryStore;
use hybridd_storage::Column;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

const SPACING: u32 = 16;

fn key() -> SecretKey {
    SecretKey::from_slice(&[0x24; 32]).expect("secret key")
}

fn payout() -> Vec<u8> {
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &key());
    p2pk_script(&pubkey.serialize())
}

fn engine_with_store() -> (ConsensusRuleEngine, Arc<MemoryStore>) {
    let params = consensus_params(Network::PosRegtest);
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedTimeProvider::new(u64::from(params.genesis.time) + 10_000));
    let engine = ConsensusRuleEngine::initialize(
        params,
        CheckpointTable::disabled(),
        Arc::new(KvCoinStore::new(Arc::clone(&store))),
        Arc::new(KvStakeStore::new(Arc::clone(&store))),
        clock,
        EngineConfig::default(),
    )
    .expect("engine");
    (engine, store)
}

fn engine() -> ConsensusRuleEngine {
    engine_with_store().0
}

fn block_time(params: &ConsensusParams, height: u32) -> u32 {
    params.genesis.time + height * SPACING
}

fn coinbase(height: u32, time: u32, vout: Vec<TxOut>) -> Transaction {
    let mut script_sig = coinbase_height_script(height);
    script_sig.extend_from_slice(&[0x51, 0x51]);
    Transaction {
        version: 1,
        time: Some(time),
        vin: vec![TxIn::new(OutPoint::null(), script_sig, u32::MAX)],
        vout,
        lock_time: 0,
    }
}

fn assemble(prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: block_merkle_root(&txids).0,
            time,
            bits: 0x207f_ffff,
            nonce: 0,
        },
        transactions,
        signature: Some(Vec::new()),
    }
}

fn work_block(params: &ConsensusParams, prev: Hash256, height: u32) -> Block {
    let time = block_time(params, height);
    let reward = proof_of_work_subsidy(height, params);
    let mut block = assemble(
        prev,
        time,
        vec![coinbase(height, time, vec![TxOut::new(reward, payout())])],
    );
    while check_proof_of_work(&block.header, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

fn stake_block(
    params: &ConsensusParams,
    prev: Hash256,
    height: u32,
    staked: &Transaction,
    claim: Amount,
) -> Block {
    let time = block_time(params, height);
    let value = staked.vout[0].value;
    let mut coinstake = Transaction {
        version: 1,
        time: Some(time),
        vin: vec![TxIn::new(OutPoint::new(staked.txid(), 0), Vec::new(), u32::MAX)],
        vout: vec![TxOut::empty(), TxOut::new(value + claim, payout())],
        lock_time: 0,
    };
    let secp = Secp256k1::new();
    let sighash = signature_hash(
        &coinstake,
        0,
        &staked.vout[0].script_pubkey,
        value,
        SighashType(SIGHASH_ALL),
        SigVersion::Base,
        None,
    )
    .expect("sighash");
    let mut signature = secp
        .sign_ecdsa(&Message::from_digest(sighash), &key())
        .serialize_der()
        .to_vec();
    signature.push(SIGHASH_ALL as u8);
    push_data(&mut coinstake.vin[0].script_sig, &signature);

    let mut block = assemble(
        prev,
        time,
        vec![coinbase(height, time, vec![TxOut::empty()]), coinstake],
    );
    sign(&mut block);
    block
}

fn sign(block: &mut Block) {
    let digest = Message::from_digest(block.hash());
    let signature = Secp256k1::new().sign_ecdsa(&digest, &key());
    block.signature = Some(signature.serialize_der().to_vec());
}

fn connect(engine: &ConsensusRuleEngine, block: &Block) -> Result<(), ConsensusError> {
    let mut context = ValidationContext::new(Arc::new(block.clone()), None);
    engine.full_validation(&mut context)
}

/// Mines `count` work blocks on top of genesis and returns them.
fn work_chain(engine: &ConsensusRuleEngine, count: u32) -> Vec<Block> {
    let params = engine.params().clone();
    let mut prev = engine.genesis_hash();
    let mut blocks = Vec::new();
    for height in 1..=count {
        let block = work_block(&params, prev, height);
        connect(engine, &block).expect("work block");
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

#[test]
fn stake_block_extends_a_mature_chain() {
    let engine = engine();
    let params = engine.params().clone();
    let blocks = work_chain(&engine, 11);
    let tip = blocks.last().expect("tip").hash();
    let staked = &blocks[0].transactions[0];

    let block = stake_block(&params, tip, 12, staked, COIN);
    connect(&engine, &block).expect("stake block");
    assert_eq!(engine.coin_tip().expect("tip").height, 12);

    let item = engine
        .get_stake(&block.hash())
        .expect("stake store")
        .expect("stake item recorded");
    assert_eq!(item.height, 12);
    assert_ne!(item.stake.flags & STAKE_FLAG_PROOF_OF_STAKE, 0);
    assert_ne!(item.stake.flags & STAKE_FLAG_MODIFIER, 0);
    assert_eq!(item.stake.prevout_stake, OutPoint::new(staked.txid(), 0));

    let parent = engine
        .get_stake(&tip)
        .expect("stake store")
        .expect("parent stake item");
    assert_eq!(
        item.stake.stake_modifier_v2,
        compute_stake_modifier_v2(Some(&parent.stake.stake_modifier_v2), &staked.txid())
    );
}

#[test]
fn work_blocks_record_stake_items_too() {
    let engine = engine();
    let blocks = work_chain(&engine, 2);
    let genesis = engine.get_stake(&engine.genesis_hash()).expect("store").expect("genesis");
    let first = engine
        .get_stake(&blocks[0].hash())
        .expect("store")
        .expect("first");
    assert!(!first.stake.is_proof_of_stake());
    assert_eq!(first.stake.hash_proof, blocks[0].hash());
    assert_eq!(
        first.stake.stake_modifier_v2,
        compute_stake_modifier_v2(Some(&genesis.stake.stake_modifier_v2), &blocks[0].hash())
    );
}

#[test]
fn shallow_stake_is_rejected() {
    let engine = engine();
    let params = engine.params().clone();
    let blocks = work_chain(&engine, 5);
    let tip = blocks.last().expect("tip").hash();
    let block = stake_block(&params, tip, 6, &blocks[0].transactions[0], COIN);
    assert_eq!(connect(&engine, &block), Err(ErrorCode::InvalidStakeDepth.into()));
    assert_eq!(engine.coin_tip().expect("tip").height, 5);
}

#[test]
fn unsigned_stake_block_is_rejected() {
    let engine = engine();
    let params = engine.params().clone();
    let blocks = work_chain(&engine, 11);
    let tip = blocks.last().expect("tip").hash();
    let mut block = stake_block(&params, tip, 12, &blocks[0].transactions[0], COIN);
    block.signature = Some(Vec::new());
    assert_eq!(connect(&engine, &block), Err(ErrorCode::BadBlockSignature.into()));
}

#[test]
fn coinstake_claiming_more_than_the_reward_is_rejected() {
    let engine = engine();
    let params = engine.params().clone();
    let blocks = work_chain(&engine, 11);
    let tip = blocks.last().expect("tip").hash();
    let block = stake_block(&params, tip, 12, &blocks[0].transactions[0], COIN + 1);
    assert_eq!(
        connect(&engine, &block),
        Err(ErrorCode::BadCoinstakeAmount.into())
    );
}

#[test]
fn misaligned_coinstake_time_is_rejected() {
    let engine = engine();
    let params = engine.params().clone();
    let blocks = work_chain(&engine, 11);
    let tip = blocks.last().expect("tip").hash();
    let mut block = stake_block(&params, tip, 12, &blocks[0].transactions[0], COIN);
    block.header.time += 1;
    sign(&mut block);
    assert_eq!(connect(&engine, &block), Err(ErrorCode::BadCoinstakeTime.into()));
}

#[test]
fn stake_items_stay_buffered_until_a_forced_flush() {
    let (engine, backing) = engine_with_store();
    let genesis = Arc::clone(engine.chain().genesis());
    engine
        .set_stake(&genesis, BlockStake::proof_of_work(genesis.hash))
        .expect("set");

    engine.flush(false).expect("threshold flush");
    assert_eq!(backing.len(Column::Stake), 0);

    engine.flush(true).expect("forced flush");
    assert_eq!(backing.len(Column::Stake), 1);
}
