//! Proof-of-work targets, chain work, and header checks.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    block_proof, compact_to_u256, hash_meets_target, next_work_required, u256_to_compact,
    CompactError, DifficultyError, HeaderInfo,
};
pub use validation::{check_proof_of_work, PowError};
