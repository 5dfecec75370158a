//! Block rejection codes and the error value passed up the rule chain.

use std::fmt;

use hybridd_pos::PosError;
use hybridd_pow::validation::PowError;
use hybridd_pow::DifficultyError;

use crate::coins::CoinViewError;
use crate::index::IndexError;
use crate::stake::StakeError;

/// Optional peer services a block may need to be validated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Capability {
    Witness,
}

/// What the orchestrator does after a block fails with a given code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Mark the block invalid, reset the header tip, maybe ban.
    Reject,
    /// The local tip no longer matches the header chain.
    Rewind,
    /// Ask peers for a missing service and retry later.
    RequestCapability(Capability),
    /// Nothing is known to be wrong with the block; leave it unmarked and
    /// deliver it again.
    Defer,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    BadVersion,
    BadDiffBits,
    HighHash,
    ProofOfWorkTooHigh,
    TimeTooOld,
    TimeTooNew,
    CheckpointMismatch,
    PrevBlockNotFound,
    InvalidPrevTip,
    BlockMarkedInvalid,
    BadMerkleRoot,
    BadTxnsDuplicate,
    BadBlockSignature,
    BadBlockLength,
    BadBlockWeight,
    BadBlockSigops,
    BadCoinbaseMissing,
    BadCoinbaseMultiple,
    BadCoinbaseLength,
    BadCoinbaseHeight,
    BadCoinbaseAmount,
    BadCoinbaseNotEmpty,
    BadCoinstakeMultiple,
    BadCoinstakeInPowBlock,
    BadCoinstakeTime,
    BadCoinstakeAmount,
    BadTxnsVinEmpty,
    BadTxnsVoutEmpty,
    BadTxnsOversize,
    BadTxnsVoutNegative,
    BadTxnsVoutTooLarge,
    BadTxnsTxoutTotalTooLarge,
    BadTxnsInputsDuplicate,
    BadTxnsPrevoutNull,
    BadTxnsNonFinal,
    BadTxnsSequenceLocks,
    BadTxnsInputsMissingOrSpent,
    BadTxnsPrematureSpend,
    BadTxnsInputValuesOutOfRange,
    BadTxnsInBelowOut,
    BadTxnsFeeOutOfRange,
    BadTxnsBip30,
    BadTxnsTimeEarlierThanInput,
    BadScript,
    BadWitnessNonceSize,
    BadWitnessMerkleMatch,
    UnexpectedWitness,
    BadStakeBlock,
    StakeTimeViolation,
    StakeHashInvalidTarget,
    InvalidStakeDepth,
    PrevStakeNull,
    StoreFailure,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 53] = [
        ErrorCode::BadVersion,
        ErrorCode::BadDiffBits,
        ErrorCode::HighHash,
        ErrorCode::ProofOfWorkTooHigh,
        ErrorCode::TimeTooOld,
        ErrorCode::TimeTooNew,
        ErrorCode::CheckpointMismatch,
        ErrorCode::PrevBlockNotFound,
        ErrorCode::InvalidPrevTip,
        ErrorCode::BlockMarkedInvalid,
        ErrorCode::BadMerkleRoot,
        ErrorCode::BadTxnsDuplicate,
        ErrorCode::BadBlockSignature,
        ErrorCode::BadBlockLength,
        ErrorCode::BadBlockWeight,
        ErrorCode::BadBlockSigops,
        ErrorCode::BadCoinbaseMissing,
        ErrorCode::BadCoinbaseMultiple,
        ErrorCode::BadCoinbaseLength,
        ErrorCode::BadCoinbaseHeight,
        ErrorCode::BadCoinbaseAmount,
        ErrorCode::BadCoinbaseNotEmpty,
        ErrorCode::BadCoinstakeMultiple,
        ErrorCode::BadCoinstakeInPowBlock,
        ErrorCode::BadCoinstakeTime,
        ErrorCode::BadCoinstakeAmount,
        ErrorCode::BadTxnsVinEmpty,
        ErrorCode::BadTxnsVoutEmpty,
        ErrorCode::BadTxnsOversize,
        ErrorCode::BadTxnsVoutNegative,
        ErrorCode::BadTxnsVoutTooLarge,
        ErrorCode::BadTxnsTxoutTotalTooLarge,
        ErrorCode::BadTxnsInputsDuplicate,
        ErrorCode::BadTxnsPrevoutNull,
        ErrorCode::BadTxnsNonFinal,
        ErrorCode::BadTxnsSequenceLocks,
        ErrorCode::BadTxnsInputsMissingOrSpent,
        ErrorCode::BadTxnsPrematureSpend,
        ErrorCode::BadTxnsInputValuesOutOfRange,
        ErrorCode::BadTxnsInBelowOut,
        ErrorCode::BadTxnsFeeOutOfRange,
        ErrorCode::BadTxnsBip30,
        ErrorCode::BadTxnsTimeEarlierThanInput,
        ErrorCode::BadScript,
        ErrorCode::BadWitnessNonceSize,
        ErrorCode::BadWitnessMerkleMatch,
        ErrorCode::UnexpectedWitness,
        ErrorCode::BadStakeBlock,
        ErrorCode::StakeTimeViolation,
        ErrorCode::StakeHashInvalidTarget,
        ErrorCode::InvalidStakeDepth,
        ErrorCode::PrevStakeNull,
        ErrorCode::StoreFailure,
    ];

    fn entry(self) -> (&'static str, &'static str) {
        match self {
            ErrorCode::BadVersion => ("bad-version", "block version rejected by active deployments"),
            ErrorCode::BadDiffBits => ("bad-diffbits", "incorrect difficulty bits"),
            ErrorCode::HighHash => ("high-hash", "proof of work failed"),
            ErrorCode::ProofOfWorkTooHigh => {
                ("proof-of-work-too-high", "proof-of-work block above the last pow height")
            }
            ErrorCode::TimeTooOld => ("time-too-old", "block timestamp too early"),
            ErrorCode::TimeTooNew => ("time-too-new", "block timestamp too far in the future"),
            ErrorCode::CheckpointMismatch => {
                ("checkpoint-mismatch", "block hash does not match checkpoint")
            }
            ErrorCode::PrevBlockNotFound => ("prev-blk-not-found", "previous block not found"),
            ErrorCode::InvalidPrevTip => ("invalid-prev-tip", "block does not extend the local tip"),
            ErrorCode::BlockMarkedInvalid => ("block-marked-invalid", "block recently rejected"),
            ErrorCode::BadMerkleRoot => ("bad-txnmrklroot", "merkle root mismatch"),
            ErrorCode::BadTxnsDuplicate => ("bad-txns-duplicate", "duplicate transaction"),
            ErrorCode::BadBlockSignature => ("bad-block-signature", "invalid block signature"),
            ErrorCode::BadBlockLength => ("bad-blk-length", "block size limits failed"),
            ErrorCode::BadBlockWeight => ("bad-blk-weight", "block weight limit exceeded"),
            ErrorCode::BadBlockSigops => ("bad-blk-sigops", "block sigop cost limit exceeded"),
            ErrorCode::BadCoinbaseMissing => ("bad-cb-missing", "first transaction is not coinbase"),
            ErrorCode::BadCoinbaseMultiple => ("bad-cb-multiple", "more than one coinbase"),
            ErrorCode::BadCoinbaseLength => ("bad-cb-length", "coinbase script size out of range"),
            ErrorCode::BadCoinbaseHeight => {
                ("bad-cb-height", "coinbase does not start with the block height")
            }
            ErrorCode::BadCoinbaseAmount => ("bad-cb-amount", "reward too high"),
            ErrorCode::BadCoinbaseNotEmpty => {
                ("bad-cb-notempty", "coinbase of a stake block pays out")
            }
            ErrorCode::BadCoinstakeMultiple => ("bad-cs-multiple", "more than one coinstake"),
            ErrorCode::BadCoinstakeInPowBlock => {
                ("bad-cs-proof-of-work", "coinstake in proof-of-work block")
            }
            ErrorCode::BadCoinstakeTime => ("bad-cs-time", "coinstake timestamp violation"),
            ErrorCode::BadCoinstakeAmount => ("bad-cs-amount", "stake reward too high"),
            ErrorCode::BadTxnsVinEmpty => ("bad-txns-vin-empty", "transaction has no inputs"),
            ErrorCode::BadTxnsVoutEmpty => ("bad-txns-vout-empty", "transaction has no outputs"),
            ErrorCode::BadTxnsOversize => ("bad-txns-oversize", "transaction too large"),
            ErrorCode::BadTxnsVoutNegative => ("bad-txns-vout-negative", "negative output value"),
            ErrorCode::BadTxnsVoutTooLarge => ("bad-txns-vout-toolarge", "output value too large"),
            ErrorCode::BadTxnsTxoutTotalTooLarge => {
                ("bad-txns-txouttotal-toolarge", "total output value too large")
            }
            ErrorCode::BadTxnsInputsDuplicate => {
                ("bad-txns-inputs-duplicate", "duplicate transaction input")
            }
            ErrorCode::BadTxnsPrevoutNull => ("bad-txns-prevout-null", "null input prevout"),
            ErrorCode::BadTxnsNonFinal => ("bad-txns-nonfinal", "non-final transaction"),
            ErrorCode::BadTxnsSequenceLocks => {
                ("bad-txns-nonfinal-sequence", "sequence locks not satisfied")
            }
            ErrorCode::BadTxnsInputsMissingOrSpent => {
                ("bad-txns-inputs-missingorspent", "input missing or spent")
            }
            ErrorCode::BadTxnsPrematureSpend => {
                ("bad-txns-premature-spend", "premature spend of coinbase or coinstake")
            }
            ErrorCode::BadTxnsInputValuesOutOfRange => {
                ("bad-txns-inputvalues-outofrange", "input values out of range")
            }
            ErrorCode::BadTxnsInBelowOut => ("bad-txns-in-belowout", "inputs below outputs"),
            ErrorCode::BadTxnsFeeOutOfRange => ("bad-txns-fee-outofrange", "fee out of range"),
            ErrorCode::BadTxnsBip30 => ("bad-txns-BIP30", "transaction overwrites unspent outputs"),
            ErrorCode::BadTxnsTimeEarlierThanInput => {
                ("bad-txns-time-earlier-than-input", "transaction predates its input")
            }
            ErrorCode::BadScript => {
                ("mandatory-script-verify-flag-failed", "script verification failed")
            }
            ErrorCode::BadWitnessNonceSize => {
                ("bad-witness-nonce-size", "invalid witness reserved value")
            }
            ErrorCode::BadWitnessMerkleMatch => {
                ("bad-witness-merkle-match", "witness merkle commitment mismatch")
            }
            ErrorCode::UnexpectedWitness => ("unexpected-witness", "unexpected witness data"),
            ErrorCode::BadStakeBlock => ("bad-stake-block", "staked output not found"),
            ErrorCode::StakeTimeViolation => {
                ("stake-time-violation", "coinstake predates the staked output")
            }
            ErrorCode::StakeHashInvalidTarget => {
                ("stake-hash-invalid-target", "stake kernel hash misses target")
            }
            ErrorCode::InvalidStakeDepth => {
                ("invalid-stake-depth", "staked output lacks confirmations")
            }
            ErrorCode::PrevStakeNull => ("prev-stake-null", "previous stake record missing"),
            ErrorCode::StoreFailure => ("store-failure", "backing store failure"),
        }
    }

    pub fn as_str(self) -> &'static str {
        self.entry().0
    }

    pub fn message(self) -> &'static str {
        self.entry().1
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == raw)
    }

    pub fn policy(self) -> FailurePolicy {
        match self {
            ErrorCode::InvalidPrevTip => FailurePolicy::Rewind,
            ErrorCode::BadWitnessNonceSize => FailurePolicy::RequestCapability(Capability::Witness),
            ErrorCode::StoreFailure | ErrorCode::PrevBlockNotFound => FailurePolicy::Defer,
            _ => FailurePolicy::Reject,
        }
    }

    /// Codes that never justify banning the sender.
    fn default_no_ban(self) -> bool {
        matches!(
            self,
            ErrorCode::TimeTooNew
                | ErrorCode::InvalidPrevTip
                | ErrorCode::PrevBlockNotFound
                | ErrorCode::BlockMarkedInvalid
                | ErrorCode::BadWitnessNonceSize
                | ErrorCode::StoreFailure
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block rejection: a stable code plus a human message. Two errors are equal
/// when their codes are.
#[derive(Clone, Debug)]
pub struct ConsensusError {
    pub code: ErrorCode,
    pub message: String,
    pub no_ban: bool,
    /// Unix time before which the block must not be retried.
    pub reject_until: Option<u64>,
}

impl ConsensusError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            no_ban: code.default_no_ban(),
            reject_until: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_reject_until(mut self, unix_time: u64) -> Self {
        self.reject_until = Some(unix_time);
        self
    }

    pub fn store_failure(detail: impl fmt::Display) -> Self {
        Self::new(ErrorCode::StoreFailure).with_message(format!("backing store failure: {detail}"))
    }

    pub fn policy(&self) -> FailurePolicy {
        self.code.policy()
    }
}

impl PartialEq for ConsensusError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for ConsensusError {}

impl PartialEq<ErrorCode> for ConsensusError {
    fn eq(&self, other: &ErrorCode) -> bool {
        self.code == *other
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ConsensusError {}

impl From<ErrorCode> for ConsensusError {
    fn from(code: ErrorCode) -> Self {
        ConsensusError::new(code)
    }
}

impl From<CoinViewError> for ConsensusError {
    fn from(err: CoinViewError) -> Self {
        ConsensusError::store_failure(err)
    }
}

impl From<StakeError> for ConsensusError {
    fn from(err: StakeError) -> Self {
        ConsensusError::store_failure(err)
    }
}

impl From<IndexError> for ConsensusError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::UnknownParent(_) | IndexError::UnknownHeader(_) => {
                ConsensusError::new(ErrorCode::PrevBlockNotFound).with_message(err.to_string())
            }
            IndexError::Compact(_) => {
                ConsensusError::new(ErrorCode::BadDiffBits).with_message(err.to_string())
            }
            IndexError::Poisoned => ConsensusError::store_failure(err),
        }
    }
}

impl From<PowError> for ConsensusError {
    fn from(err: PowError) -> Self {
        let code = match err {
            PowError::HashMismatch => ErrorCode::HighHash,
            PowError::InvalidBits(_) | PowError::Compact(_) => ErrorCode::BadDiffBits,
        };
        ConsensusError::new(code).with_message(err.to_string())
    }
}

impl From<DifficultyError> for ConsensusError {
    fn from(err: DifficultyError) -> Self {
        let code = match err {
            DifficultyError::MissingAncestor(_) => ErrorCode::PrevBlockNotFound,
            DifficultyError::Compact(_) => ErrorCode::BadDiffBits,
        };
        ConsensusError::new(code).with_message(err.to_string())
    }
}

impl From<PosError> for ConsensusError {
    fn from(err: PosError) -> Self {
        let code = match err {
            PosError::Compact(_) => ErrorCode::BadDiffBits,
            PosError::MissingAncestor(_) => ErrorCode::PrevStakeNull,
            PosError::StakeTimeViolation => ErrorCode::StakeTimeViolation,
            PosError::StakeHashInvalidTarget => ErrorCode::StakeHashInvalidTarget,
            PosError::InvalidStakeDepth => ErrorCode::InvalidStakeDepth,
            PosError::CoinbaseNotEmpty => ErrorCode::BadCoinbaseNotEmpty,
            PosError::MultipleCoinstake => ErrorCode::BadCoinstakeMultiple,
            PosError::CoinstakeInPowBlock => ErrorCode::BadCoinstakeInPowBlock,
            PosError::CoinstakeTimeMismatch | PosError::BadCoinstakeTimestamp => {
                ErrorCode::BadCoinstakeTime
            }
            PosError::BadBlockSignature(_) => ErrorCode::BadBlockSignature,
        };
        ConsensusError::new(code).with_message(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_message() {
        let plain = ConsensusError::new(ErrorCode::BadCoinbaseAmount);
        let detailed = ConsensusError::new(ErrorCode::BadCoinbaseAmount).with_message("pays 51");
        assert_eq!(plain, detailed);
        assert_ne!(plain, ConsensusError::new(ErrorCode::BadCoinstakeAmount));
        assert_eq!(plain, ErrorCode::BadCoinbaseAmount);
    }

    #[test]
    fn codes_are_unique_and_parse_back() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::ALL {
            assert!(seen.insert(code.as_str()), "duplicate code {code}");
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
    }

    #[test]
    fn store_failures_never_ban() {
        let err = ConsensusError::store_failure("disk full");
        assert_eq!(err.code, ErrorCode::StoreFailure);
        assert!(err.no_ban);
        assert!(err.message.contains("disk full"));
    }

    #[test]
    fn policies_follow_codes() {
        assert_eq!(ErrorCode::InvalidPrevTip.policy(), FailurePolicy::Rewind);
        assert_eq!(
            ErrorCode::BadWitnessNonceSize.policy(),
            FailurePolicy::RequestCapability(Capability::Witness)
        );
        assert_eq!(ErrorCode::BadScript.policy(), FailurePolicy::Reject);
    }

    #[test]
    fn local_failures_are_deferred() {
        assert_eq!(
            ConsensusError::store_failure("read timed out").policy(),
            FailurePolicy::Defer
        );
        assert_eq!(ErrorCode::PrevBlockNotFound.policy(), FailurePolicy::Defer);
    }
}
