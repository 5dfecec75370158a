//! Block merkle roots and the segwit commitment.

use std::collections::HashSet;

use hybridd_consensus::constants::{MIN_WITNESS_COMMITMENT_LEN, WITNESS_COMMITMENT_HEADER};
use hybridd_consensus::Hash256;
use hybridd_primitives::block::Block;
use hybridd_primitives::hash::sha256d_pair;
use hybridd_primitives::transaction::Transaction;

const MAX_LEVELS: usize = 32;

/// Computes the root of `leaves` bottom-up in constant space.
///
/// Returns `(root, mutated)`. `mutated` is set when a node is paired with an
/// identical sibling, which is how a duplicated trailing run of transactions
/// produces the same root as the original list.
pub fn compute_merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }

    let mut inner = [[0u8; 32]; MAX_LEVELS];
    let mut mutated = false;
    let mut count: u64 = 0;

    for leaf in leaves {
        let mut hash = *leaf;
        count += 1;
        let mut level = 0;
        while count & (1 << level) == 0 {
            mutated |= inner[level] == hash;
            hash = sha256d_pair(&inner[level], &hash);
            level += 1;
        }
        inner[level] = hash;
    }

    let mut level = 0;
    while count & (1 << level) == 0 {
        level += 1;
    }
    let mut hash = inner[level];
    while count != 1 << level {
        // odd node at this level pairs with itself
        hash = sha256d_pair(&hash, &hash);
        count += 1 << level;
        level += 1;
        while count & (1 << level) == 0 {
            hash = sha256d_pair(&inner[level], &hash);
            level += 1;
        }
    }
    (hash, mutated)
}

pub fn block_merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    compute_merkle_root(txids)
}

/// True when any txid appears more than once. The merkle mutation flag only
/// catches duplicates that end up as siblings; `[a, b, b]` slips past it.
pub fn has_duplicate_txids(txids: &[Hash256]) -> bool {
    if txids.windows(2).any(|pair| pair[0] == pair[1]) {
        return true;
    }
    let mut seen = HashSet::with_capacity(txids.len());
    !txids.iter().all(|txid| seen.insert(*txid))
}

/// Witness root over wtxids with the coinbase slot zeroed.
pub fn witness_merkle_root(transactions: &[Transaction]) -> (Hash256, bool) {
    let leaves: Vec<Hash256> = transactions
        .iter()
        .enumerate()
        .map(|(index, tx)| if index == 0 { [0u8; 32] } else { tx.wtxid() })
        .collect();
    compute_merkle_root(&leaves)
}

/// Index of the last coinbase output carrying a witness commitment.
pub fn witness_commitment_index(block: &Block) -> Option<usize> {
    let coinbase = block.transactions.first()?;
    coinbase.vout.iter().rposition(|output| {
        output.script_pubkey.len() >= MIN_WITNESS_COMMITMENT_LEN
            && output.script_pubkey.starts_with(&WITNESS_COMMITMENT_HEADER)
    })
}

/// `sha256d(witness_root ∥ reserved_value)`.
pub fn witness_commitment(witness_root: &Hash256, reserved_value: &Hash256) -> Hash256 {
    sha256d_pair(witness_root, reserved_value)
}

/// Builds the coinbase commitment output script for `transactions`.
pub fn witness_commitment_script(transactions: &[Transaction], reserved_value: &Hash256) -> Vec<u8> {
    let (root, _) = witness_merkle_root(transactions);
    let commitment = witness_commitment(&root, reserved_value);
    let mut script = Vec::with_capacity(MIN_WITNESS_COMMITMENT_LEN);
    script.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
    script.extend_from_slice(&commitment);
    script
}
