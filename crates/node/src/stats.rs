use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use hybridd_consensus::hash256_to_hex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::orchestrator::ConsensusManager;

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    pub network: String,
    pub tip_height: u32,
    pub tip_hash: String,
    pub best_header_height: u32,
    pub header_gap: u64,
    pub sync_state: String,
    pub uptime_secs: u64,
    pub unix_time_secs: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rewinds: u64,
    pub rewound_blocks: u64,
    pub bans: u64,
    pub capability_requests: u64,
    pub deferred: u64,
    pub invalid_blocks: usize,
    pub validated_blocks: u64,
    pub skipped_blocks: u64,
    pub full_us: u64,
    pub script_us: u64,
    pub script_checks: u64,
    pub coin_cache_hits: u64,
    pub coin_cache_misses: u64,
    pub coin_cache_entries: usize,
    pub dirty_coins: usize,
    pub coin_flushes: u64,
    pub prefetched_blocks: u64,
    pub prefetch_skipped: u64,
    pub prefetch_dropped: u64,
    pub stake_cache_items: usize,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

pub fn snapshot_stats(manager: &ConsensusManager, start_time: Instant) -> StatsSnapshot {
    let engine = manager.engine();
    let services = engine.services();
    let tip = manager.tip();
    let best_header = engine.chain().most_work_tip();
    let header_gap = u64::from(best_header.height.saturating_sub(tip.height));
    let sync_state = if engine.is_initial_block_download() {
        "ibd"
    } else if header_gap > 0 {
        "syncing"
    } else {
        "synced"
    };

    let unix_time_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manager_metrics = manager.metrics().snapshot();
    let validation = services.metrics.snapshot();
    let cache = services.coins.stats();
    let prefetch = manager
        .prefetch_metrics()
        .map(|metrics| metrics.snapshot())
        .unwrap_or_default();

    StatsSnapshot {
        network: engine.params().network.name().to_string(),
        tip_height: tip.height,
        tip_hash: hash256_to_hex(&tip.hash),
        best_header_height: best_header.height,
        header_gap,
        sync_state: sync_state.to_string(),
        uptime_secs: start_time.elapsed().as_secs(),
        unix_time_secs,
        accepted: manager_metrics.accepted,
        rejected: manager_metrics.rejected,
        rewinds: manager_metrics.rewinds,
        rewound_blocks: manager_metrics.rewound_blocks,
        bans: manager_metrics.bans,
        capability_requests: manager_metrics.capability_requests,
        deferred: manager_metrics.deferred,
        invalid_blocks: manager.invalid_blocks().len(),
        validated_blocks: validation.blocks,
        skipped_blocks: validation.skipped_blocks,
        full_us: validation.full_us,
        script_us: validation.script_us,
        script_checks: validation.script_checks,
        coin_cache_hits: cache.hits,
        coin_cache_misses: cache.misses,
        coin_cache_entries: cache.entries,
        dirty_coins: cache.dirty,
        coin_flushes: cache.flushes,
        prefetched_blocks: prefetch.prefetched_blocks,
        prefetch_skipped: prefetch.skipped_blocks,
        prefetch_dropped: prefetch.dropped_batches,
        stake_cache_items: services.stakes.len(),
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn blocks_per_sec(current: &StatsSnapshot, last: Option<&StatsSnapshot>) -> String {
    let Some(prev) = last else {
        return "-".to_string();
    };
    let delta_time = current.unix_time_secs.saturating_sub(prev.unix_time_secs);
    if delta_time == 0 {
        return "-".to_string();
    }
    let blocks = current.accepted.saturating_sub(prev.accepted);
    format!("{:.2}", blocks as f64 / delta_time as f64)
}

fn ms_per_block(current: &StatsSnapshot, last: Option<&StatsSnapshot>) -> (String, String) {
    let Some(prev) = last else {
        return ("-".to_string(), "-".to_string());
    };
    let blocks = current.validated_blocks.saturating_sub(prev.validated_blocks);
    if blocks == 0 {
        return ("-".to_string(), "-".to_string());
    }
    let full_us = current.full_us.saturating_sub(prev.full_us);
    let script_us = current.script_us.saturating_sub(prev.script_us);
    (
        format!("{:.2}", full_us as f64 / blocks as f64 / 1000.0),
        format!("{:.2}", script_us as f64 / blocks as f64 / 1000.0),
    )
}

pub fn status_line(current: &StatsSnapshot, last: Option<&StatsSnapshot>) -> String {
    let (full_ms, script_ms) = ms_per_block(current, last);
    format!(
        "Status: {} tip {} ({}) headers {} gap {} b/s {} full_ms {} script_ms {} accepted {} rejected {} rewinds {} cache_hit {} cache_miss {} dirty {} prefetched {} stakes {} uptime {}s",
        current.sync_state,
        current.tip_height,
        short_hash(&current.tip_hash),
        current.best_header_height,
        current.header_gap,
        blocks_per_sec(current, last),
        full_ms,
        script_ms,
        current.accepted,
        current.rejected,
        current.rewinds,
        current.coin_cache_hits,
        current.coin_cache_misses,
        current.dirty_coins,
        current.prefetched_blocks,
        current.stake_cache_items,
        current.uptime_secs,
    )
}

/// Logs a status line every `interval_secs` until shutdown. Returns `None`
/// when the interval is 0.
pub fn spawn_stats_sampler(
    manager: Arc<ConsensusManager>,
    interval_secs: u64,
    start_time: Instant,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    let interval = std::time::Duration::from_secs(interval_secs);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut last: Option<StatsSnapshot> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let stats = snapshot_stats(&manager, start_time);
            log_info!("{}", status_line(&stats, last.as_ref()));
            log_debug!("stats {}", stats.to_json());
            last = Some(stats);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(unix_time_secs: u64, accepted: u64, validated: u64, full_us: u64) -> StatsSnapshot {
        StatsSnapshot {
            tip_hash: "00ab".repeat(16),
            unix_time_secs,
            accepted,
            validated_blocks: validated,
            full_us,
            ..StatsSnapshot::default()
        }
    }

    #[test]
    fn rates_need_a_previous_sample() {
        let current = sample(100, 10, 10, 5_000);
        assert_eq!(blocks_per_sec(&current, None), "-");
        let previous = sample(90, 5, 5, 0);
        assert_eq!(blocks_per_sec(&current, Some(&previous)), "0.50");
        assert_eq!(ms_per_block(&current, Some(&previous)).0, "1.00");
    }

    #[test]
    fn status_line_uses_short_hashes() {
        let line = status_line(&sample(1, 0, 0, 0), None);
        assert!(line.contains("(00ab00ab00ab)"));
    }

    #[test]
    fn json_carries_counters() {
        let value: serde_json::Value =
            serde_json::from_str(&sample(7, 3, 3, 0).to_json()).expect("json");
        assert_eq!(value["accepted"], 3);
        assert_eq!(value["unix_time_secs"], 7);
    }
}
