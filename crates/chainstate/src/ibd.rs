//! Initial block download detection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use hybridd_consensus::{CheckpointTable, ConsensusParams};
use primitive_types::U256;

use crate::index::ChainedHeader;

/// Network-adjusted clock.
pub trait TimeProvider: Send + Sync {
    fn adjusted_time(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn adjusted_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedTimeProvider {
    now: AtomicU64,
}

impl FixedTimeProvider {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl TimeProvider for FixedTimeProvider {
    fn adjusted_time(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Seconds a computed answer stays valid.
pub const IBD_CACHE_SECONDS: u64 = 60;

#[derive(Clone, Copy, Debug)]
struct CachedAnswer {
    value: bool,
    tip: [u8; 32],
    expires_at: u64,
}

pub struct InitialBlockDownloadState {
    max_tip_age: u64,
    minimum_chain_work: U256,
    last_checkpoint_height: u32,
    cached: Mutex<Option<CachedAnswer>>,
}

impl InitialBlockDownloadState {
    pub fn new(params: &ConsensusParams, checkpoints: &CheckpointTable, max_tip_age: u64) -> Self {
        Self {
            max_tip_age,
            minimum_chain_work: U256::from_little_endian(&params.minimum_chain_work),
            last_checkpoint_height: checkpoints.last_checkpoint_height(),
            cached: Mutex::new(None),
        }
    }

    /// True while `tip` is missing, below the last checkpoint, short of the
    /// minimum chain work, or older than the maximum tip age. Answers are
    /// reused for the same tip until they expire.
    pub fn is_initial_block_download(
        &self,
        tip: Option<&ChainedHeader>,
        time: &dyn TimeProvider,
    ) -> bool {
        let now = time.adjusted_time();
        let Some(tip) = tip else {
            return true;
        };

        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(answer) = *cached {
            if answer.tip == tip.hash && now < answer.expires_at {
                return answer.value;
            }
        }

        let value = self.compute(tip, now);
        *cached = Some(CachedAnswer {
            value,
            tip: tip.hash,
            expires_at: now.saturating_add(IBD_CACHE_SECONDS),
        });
        value
    }

    fn compute(&self, tip: &ChainedHeader, now: u64) -> bool {
        if tip.height < self.last_checkpoint_height {
            return true;
        }
        if tip.chain_work < self.minimum_chain_work {
            return true;
        }
        u64::from(tip.header.time) < now.saturating_sub(self.max_tip_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_consensus::{consensus_params, CheckpointInfo, Network};
    use hybridd_primitives::block::BlockHeader;

    fn tip(height: u32, time: u32, work: u64) -> ChainedHeader {
        let header = BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce: height,
        };
        ChainedHeader {
            hash: header.hash(),
            header,
            height,
            chain_work: U256::from(work),
            prev: Some([1u8; 32]),
            proof_of_stake: false,
        }
    }

    #[test]
    fn no_tip_is_initial_download() {
        let params = consensus_params(Network::PowRegtest);
        let state = InitialBlockDownloadState::new(&params, &CheckpointTable::disabled(), 3_600);
        assert!(state.is_initial_block_download(None, &FixedTimeProvider::new(0)));
    }

    #[test]
    fn stale_tip_is_initial_download_until_cache_expires() {
        let params = consensus_params(Network::PowRegtest);
        let state = InitialBlockDownloadState::new(&params, &CheckpointTable::disabled(), 3_600);
        let clock = FixedTimeProvider::new(12_590);
        let recent = tip(5, 9_000, 10);
        assert!(!state.is_initial_block_download(Some(&recent), &clock));

        clock.advance(30);
        // cached answer for the same tip
        assert!(!state.is_initial_block_download(Some(&recent), &clock));
        clock.advance(IBD_CACHE_SECONDS);
        assert!(state.is_initial_block_download(Some(&recent), &clock));
    }

    #[test]
    fn checkpoint_and_work_floors_apply() {
        let mut params = consensus_params(Network::PowRegtest);
        params.minimum_chain_work = U256::from(100u64).to_little_endian();
        let checkpoints = CheckpointTable::new([(
            20,
            CheckpointInfo {
                hash: [7u8; 32],
                stake_modifier: None,
            },
        )]);
        let state = InitialBlockDownloadState::new(&params, &checkpoints, 3_600);
        let clock = FixedTimeProvider::new(10_000);
        assert!(state.is_initial_block_download(Some(&tip(19, 9_999, 500)), &clock));
        assert!(state.is_initial_block_download(Some(&tip(25, 9_999, 99)), &clock));
        assert!(!state.is_initial_block_download(Some(&tip(26, 9_999, 100)), &clock));
    }
}
