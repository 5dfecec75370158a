//! Rule engine timing metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::rules::RulePhase;

#[derive(Debug, Default)]
pub struct ValidationMetrics {
    header_us: AtomicU64,
    integrity_us: AtomicU64,
    partial_us: AtomicU64,
    full_us: AtomicU64,
    blocks: AtomicU64,
    skipped_blocks: AtomicU64,
    script_us: AtomicU64,
    script_checks: AtomicU64,
    coin_fetch_us: AtomicU64,
    coin_fetch_ids: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationMetricsSnapshot {
    pub header_us: u64,
    pub integrity_us: u64,
    pub partial_us: u64,
    pub full_us: u64,
    pub blocks: u64,
    pub skipped_blocks: u64,
    pub script_us: u64,
    pub script_checks: u64,
    pub coin_fetch_us: u64,
    pub coin_fetch_ids: u64,
}

impl ValidationMetrics {
    pub fn record_phase(&self, phase: RulePhase, elapsed: Duration) {
        let slot = match phase {
            RulePhase::Header => &self.header_us,
            RulePhase::Integrity => &self.integrity_us,
            RulePhase::Partial => &self.partial_us,
            RulePhase::Full => &self.full_us,
        };
        slot.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_block(&self, skipped: bool) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        if skipped {
            self.skipped_blocks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_scripts(&self, checks: usize, elapsed: Duration) {
        self.script_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.script_checks
            .fetch_add(checks as u64, Ordering::Relaxed);
    }

    pub fn record_coin_fetch(&self, ids: usize, elapsed: Duration) {
        self.coin_fetch_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.coin_fetch_ids.fetch_add(ids as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValidationMetricsSnapshot {
        ValidationMetricsSnapshot {
            header_us: self.header_us.load(Ordering::Relaxed),
            integrity_us: self.integrity_us.load(Ordering::Relaxed),
            partial_us: self.partial_us.load(Ordering::Relaxed),
            full_us: self.full_us.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            skipped_blocks: self.skipped_blocks.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_checks: self.script_checks.load(Ordering::Relaxed),
            coin_fetch_us: self.coin_fetch_us.load(Ordering::Relaxed),
            coin_fetch_ids: self.coin_fetch_ids.load(Ordering::Relaxed),
        }
    }
}
