//! Memory monitor (spec §2 ambient observability item): a periodic
//! snapshot of how much memory the loader currently holds, broken down by
//! subsystem, logged at `debug` so operators can correlate a stall or an
//! OOM with shard-cache growth vs. GPU-pool growth vs. expert-cache churn.

use crate::expert_cache::ExpertCacheStats;
use crate::gpu::PoolStats;

/// A single point-in-time reading across every tracked subsystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySnapshot {
    pub gpu_live_buffers: usize,
    pub gpu_live_bytes: u64,
    pub shard_cache_entries: usize,
    pub shard_cache_bytes: u64,
    pub expert_cache_bytes: u64,
    pub expert_cache_max_bytes: u64,
    pub loaded_layers: usize,
}

impl MemorySnapshot {
    pub fn capture(
        pool_stats: PoolStats,
        shard_cache_entries: usize,
        shard_cache_bytes: u64,
        expert_stats: Option<ExpertCacheStats>,
        loaded_layers: usize,
    ) -> Self {
        let (expert_cache_bytes, expert_cache_max_bytes) = expert_stats
            .map(|s| (s.current_size, s.max_size))
            .unwrap_or_default();
        Self {
            gpu_live_buffers: pool_stats.live_buffers,
            gpu_live_bytes: pool_stats.live_bytes,
            shard_cache_entries,
            shard_cache_bytes,
            expert_cache_bytes,
            expert_cache_max_bytes,
            loaded_layers,
        }
    }

    pub fn log(&self) {
        tracing::debug!(
            gpu_live_buffers = self.gpu_live_buffers,
            gpu_live_bytes = self.gpu_live_bytes,
            shard_cache_entries = self.shard_cache_entries,
            shard_cache_bytes = self.shard_cache_bytes,
            expert_cache_bytes = self.expert_cache_bytes,
            expert_cache_max_bytes = self.expert_cache_max_bytes,
            loaded_layers = self.loaded_layers,
            "loader memory snapshot"
        );
    }
}

/// Periodic monitor driven by the orchestrator on a `log_interval_ms`
/// tick (spec's `MemoryManagementConfig::log_interval_ms`). Kept separate
/// from the snapshot type itself so tests can assert on `MemorySnapshot`
/// without spinning up a timer.
pub struct MemoryMonitor {
    history: Vec<MemorySnapshot>,
    max_history: usize,
}

impl MemoryMonitor {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: Vec::new(),
            max_history,
        }
    }

    pub fn record(&mut self, snapshot: MemorySnapshot) {
        snapshot.log();
        self.history.push(snapshot);
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }
    }

    pub fn latest(&self) -> Option<&MemorySnapshot> {
        self.history.last()
    }

    pub fn history(&self) -> &[MemorySnapshot] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_combines_subsystem_readings() {
        let pool_stats = PoolStats {
            live_buffers: 3,
            live_bytes: 1024,
        };
        let expert_stats = ExpertCacheStats {
            hits: 1,
            misses: 1,
            evictions: 0,
            current_size: 512,
            max_size: 2048,
            expert_count: 1,
            hit_rate: 0.5,
            in_use_count: 0,
            pinned_count: 0,
        };
        let snapshot = MemorySnapshot::capture(pool_stats, 2, 256, Some(expert_stats), 4);
        assert_eq!(snapshot.gpu_live_buffers, 3);
        assert_eq!(snapshot.expert_cache_bytes, 512);
        assert_eq!(snapshot.loaded_layers, 4);
    }

    #[test]
    fn monitor_bounds_history_length() {
        let mut monitor = MemoryMonitor::new(2);
        for layers in 0..5 {
            monitor.record(MemorySnapshot {
                loaded_layers: layers,
                ..Default::default()
            });
        }
        assert_eq!(monitor.history().len(), 2);
        assert_eq!(monitor.latest().unwrap().loaded_layers, 4);
    }
}
