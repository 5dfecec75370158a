//! Proof-of-stake kernel, stake modifier, stake retarget and block signatures.

pub mod kernel;
pub mod modifier;
pub mod retarget;
pub mod validation;

use hybridd_pow::CompactError;

pub use kernel::{check_stake_depth, check_stake_kernel_hash, stake_kernel_hash};
pub use modifier::{compute_stake_modifier_v2, stake_entropy_bit};
pub use retarget::{calculate_retarget, next_target_required, RetargetHeader};
pub use validation::{check_block_shape, check_block_signature, check_coinstake_timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PosError {
    Compact(CompactError),
    MissingAncestor(u32),
    StakeTimeViolation,
    StakeHashInvalidTarget,
    InvalidStakeDepth,
    CoinbaseNotEmpty,
    MultipleCoinstake,
    CoinstakeInPowBlock,
    CoinstakeTimeMismatch,
    BadCoinstakeTimestamp,
    BadBlockSignature(&'static str),
}

impl std::fmt::Display for PosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PosError::Compact(err) => write!(f, "{err}"),
            PosError::MissingAncestor(height) => {
                write!(f, "stake retarget ancestor at height {height} not found")
            }
            PosError::StakeTimeViolation => write!(f, "coinstake predates the staked output"),
            PosError::StakeHashInvalidTarget => write!(f, "stake kernel hash misses target"),
            PosError::InvalidStakeDepth => write!(f, "staked output lacks confirmations"),
            PosError::CoinbaseNotEmpty => write!(f, "coinbase of a stake block pays out"),
            PosError::MultipleCoinstake => write!(f, "more than one coinstake in block"),
            PosError::CoinstakeInPowBlock => write!(f, "coinstake in proof-of-work block"),
            PosError::CoinstakeTimeMismatch => write!(f, "coinstake time differs from block time"),
            PosError::BadCoinstakeTimestamp => write!(f, "coinstake time off the stake mask"),
            PosError::BadBlockSignature(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for PosError {}

impl From<CompactError> for PosError {
    fn from(err: CompactError) -> Self {
        PosError::Compact(err)
    }
}
