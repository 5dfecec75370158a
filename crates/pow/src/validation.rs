use hybridd_consensus::ConsensusParams;
use hybridd_primitives::block::BlockHeader;

use crate::difficulty::{compact_to_u256, hash_meets_target, CompactError};

#[derive(Debug, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that the header hash satisfies its own claimed target and that the
/// target lies within the network limit.
pub fn check_proof_of_work(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let limit = compact_to_u256(params.pow_limit)?;
    if target > limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    if !hash_meets_target(&header.hash(), &target) {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}
