//! Consensus-wide constants shared across validation.

/// Scale factor between non-witness bytes and weight units.
pub const WITNESS_SCALE_FACTOR: u64 = 4;
/// Maximum block weight (BIP141).
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;
/// Maximum serialized block size including witness data.
pub const MAX_BLOCK_SERIALIZED_SIZE: u64 = 4_000_000;
/// Maximum signature operation cost per block.
pub const MAX_BLOCK_SIGOPS_COST: u64 = 80_000;
/// Coinbase scriptSig length bounds.
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;
/// Blocks used for median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Threshold for `lock_time`: below this value it is a height, otherwise a unix time.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// BIP68 sequence lock encoding.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Prefix of the BIP141 witness commitment output script.
pub const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
/// Minimum size of a witness commitment output script.
pub const MIN_WITNESS_COMMITMENT_LEN: usize = 38;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
