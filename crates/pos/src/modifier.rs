use hybridd_consensus::Hash256;
use hybridd_primitives::hash::sha256d_pair;

/// Modifier of a block from its kernel selector and its parent's modifier.
///
/// The selector is the block hash for proof-of-work blocks and the staked
/// prevout hash for proof-of-stake blocks. The genesis block has no parent and
/// gets the zero modifier.
pub fn compute_stake_modifier_v2(prev_modifier: Option<&Hash256>, kernel: &Hash256) -> Hash256 {
    match prev_modifier {
        None => [0u8; 32],
        Some(prev) => sha256d_pair(kernel, prev),
    }
}

/// Low bit of the block hash.
pub fn stake_entropy_bit(block_hash: &Hash256) -> bool {
    block_hash[0] & 1 == 1
}
