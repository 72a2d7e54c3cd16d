//! Expert LRU Cache (spec §4.7): a byte-budgeted, pin/in-use-aware LRU
//! cache of Mixture-of-Experts weight buffers, keyed by `(layer, expert)`.
//! Distinct from the Shard Cache (`shard_cache.rs`): this one evicts GPU
//! buffers, not compressed shard bytes, and tracks usage state that the
//! orchestrator sets while a forward pass is in flight.

use std::collections::{HashMap, HashSet};

use crate::gpu::{GpuBufferPool, WeightBuffer};

/// `(layer, expert)` identity of one expert's weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpertId {
    pub layer: usize,
    pub expert: usize,
}

impl ExpertId {
    pub fn new(layer: usize, expert: usize) -> Self {
        Self { layer, expert }
    }
}

struct Entry {
    buffer: WeightBuffer,
    byte_len: u64,
    last_access: u64,
}

/// Aggregate counters (spec §4.7 "Stats").
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpertCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: u64,
    pub max_size: u64,
    pub expert_count: usize,
    pub hit_rate: f64,
    pub in_use_count: usize,
    pub pinned_count: usize,
}

/// LRU cache of expert weight buffers, bounded by `max_bytes`.
pub struct ExpertLruCache {
    entries: HashMap<ExpertId, Entry>,
    current_bytes: u64,
    max_bytes: u64,
    access_counter: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    in_use: HashSet<ExpertId>,
    pinned: HashSet<ExpertId>,
}

impl ExpertLruCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            current_bytes: 0,
            max_bytes,
            access_counter: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            in_use: HashSet::new(),
            pinned: HashSet::new(),
        }
    }

    /// `maxBytes = min(defaultSizeBytes, floor(deviceMaxBufferSize *
    /// maxBufferPercentage))` (spec §4.7 `autoTune`).
    pub fn auto_tune(default_size_bytes: u64, device_max_buffer_size: u64, max_buffer_percentage: f64) -> u64 {
        let scaled = (device_max_buffer_size as f64 * max_buffer_percentage).floor() as u64;
        default_size_bytes.min(scaled)
    }

    pub fn get(&mut self, id: ExpertId) -> Option<&WeightBuffer> {
        self.access_counter += 1;
        let counter = self.access_counter;
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.last_access = counter;
                self.hits += 1;
                Some(&self.entries.get(&id).unwrap().buffer)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace an expert's weight buffer, evicting LRU entries
    /// (skipping in-use/pinned ones) until there's room. Returns the
    /// buffers evicted so the caller can release them on the GPU pool.
    pub fn put(&mut self, id: ExpertId, buffer: WeightBuffer, byte_len: u64) -> Vec<WeightBuffer> {
        let mut evicted = Vec::new();

        if let Some(old) = self.entries.remove(&id) {
            self.current_bytes -= old.byte_len;
            evicted.push(old.buffer);
        }

        while self.current_bytes + byte_len > self.max_bytes && !self.entries.is_empty() {
            match self.evict_lru() {
                Some(victim) => evicted.push(victim),
                None => {
                    tracing::warn!(
                        layer = id.layer,
                        expert = id.expert,
                        "expert cache cannot make room: all entries in use or pinned, refusing insert"
                    );
                    evicted.push(buffer);
                    return evicted;
                }
            }
        }

        self.access_counter += 1;
        self.entries.insert(
            id,
            Entry {
                buffer,
                byte_len,
                last_access: self.access_counter,
            },
        );
        self.current_bytes += byte_len;
        evicted
    }

    /// Evict the least-recently-used entry that is neither in-use nor
    /// pinned. Returns `None` if no entry is eligible.
    pub fn evict_lru(&mut self) -> Option<WeightBuffer> {
        let victim = self
            .entries
            .iter()
            .filter(|(id, _)| !self.in_use.contains(id) && !self.pinned.contains(id))
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(id, _)| *id)?;

        let entry = self.entries.remove(&victim)?;
        self.current_bytes -= entry.byte_len;
        self.evictions += 1;
        Some(entry.buffer)
    }

    pub fn mark_in_use(&mut self, id: ExpertId) {
        self.in_use.insert(id);
    }

    pub fn mark_not_in_use(&mut self, id: ExpertId) {
        self.in_use.remove(&id);
    }

    pub fn clear_in_use(&mut self) {
        self.in_use.clear();
    }

    pub fn pin_expert(&mut self, id: ExpertId) {
        self.pinned.insert(id);
    }

    pub fn unpin_expert(&mut self, id: ExpertId) {
        self.pinned.remove(&id);
    }

    /// Pin every expert of `layer` whose index is in `shared_expert_indices`
    /// (e.g. gpt-oss shared experts that must never be evicted mid-layer).
    pub fn pin_shared_experts(&mut self, layer: usize, shared_expert_indices: &[usize]) {
        for &expert in shared_expert_indices {
            self.pinned.insert(ExpertId::new(layer, expert));
        }
    }

    pub fn contains(&self, id: ExpertId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Release every remaining buffer through `pool`, used when the
    /// loader tears down (spec §4.8 `clear`).
    pub fn clear(&mut self, pool: &dyn GpuBufferPool) {
        for (_, entry) in self.entries.drain() {
            if let Err(err) = pool.release_buffer(entry.buffer.buffer) {
                tracing::warn!(error = %err, "failed to release expert buffer during clear");
            }
        }
        self.current_bytes = 0;
        self.in_use.clear();
        self.pinned.clear();
    }

    pub fn stats(&self) -> ExpertCacheStats {
        let total = self.hits + self.misses;
        ExpertCacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            current_size: self.current_bytes,
            max_size: self.max_bytes,
            expert_count: self.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { self.hits as f64 / total as f64 },
            in_use_count: self.in_use.len(),
            pinned_count: self.pinned.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{GpuDtype, Layout};
    use crate::gpu::{wrap_bytes, CpuReferencePool};

    fn buffer(pool: &CpuReferencePool, bytes: u64) -> (WeightBuffer, u64) {
        let handle = wrap_bytes(pool, &vec![0u8; bytes as usize], "expert").unwrap();
        (
            WeightBuffer {
                buffer: handle,
                dtype: GpuDtype::F16,
                layout: Layout::Row,
                shape: vec![bytes as usize / 2],
                label: "expert".into(),
            },
            bytes,
        )
    }

    #[test]
    fn get_on_empty_cache_is_a_miss() {
        let mut cache = ExpertLruCache::new(1024);
        assert!(cache.get(ExpertId::new(0, 0)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn put_then_get_is_a_hit() {
        let pool = CpuReferencePool::new();
        let mut cache = ExpertLruCache::new(1024);
        let (buf, len) = buffer(&pool, 64);
        cache.put(ExpertId::new(0, 1), buf, len);
        assert!(cache.get(ExpertId::new(0, 1)).is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn eviction_under_pressure_skips_pinned_and_in_use() {
        // 300MB budget, five 80MB experts (spec §8 scenario).
        let pool = CpuReferencePool::new();
        let mut cache = ExpertLruCache::new(300 * 1024 * 1024);
        for i in 0..3 {
            let (buf, len) = buffer(&pool, 80 * 1024 * 1024);
            cache.put(ExpertId::new(0, i), buf, len);
        }
        cache.pin_expert(ExpertId::new(0, 0));
        cache.mark_in_use(ExpertId::new(0, 1));

        let (buf, len) = buffer(&pool, 80 * 1024 * 1024);
        let evicted = cache.put(ExpertId::new(0, 3), buf, len);

        // Only expert 2 (neither pinned nor in-use) was eligible.
        assert_eq!(evicted.len(), 1);
        assert!(cache.contains(ExpertId::new(0, 0)));
        assert!(cache.contains(ExpertId::new(0, 1)));
        assert!(!cache.contains(ExpertId::new(0, 2)));
        assert!(cache.contains(ExpertId::new(0, 3)));
    }

    #[test]
    fn put_refused_when_no_entry_is_evictable() {
        // Every existing entry pinned or in-use: a `put` that would need
        // room must be refused outright, never exceeding `max_bytes`
        // (spec §4.7, §8 scenario 6).
        let pool = CpuReferencePool::new();
        let mut cache = ExpertLruCache::new(100 * 1024 * 1024);
        for i in 0..2 {
            let (buf, len) = buffer(&pool, 40 * 1024 * 1024);
            cache.put(ExpertId::new(0, i), buf, len);
        }
        cache.pin_expert(ExpertId::new(0, 0));
        cache.mark_in_use(ExpertId::new(0, 1));

        let bytes_before = cache.current_bytes;
        let (buf, len) = buffer(&pool, 40 * 1024 * 1024);
        let evicted = cache.put(ExpertId::new(0, 2), buf, len);

        // The incoming buffer is handed back for the caller to release,
        // neither existing entry was touched, and the cache did not grow.
        assert_eq!(evicted.len(), 1);
        assert_eq!(cache.current_bytes, bytes_before);
        assert!(cache.current_bytes <= cache.max_bytes);
        assert!(!cache.contains(ExpertId::new(0, 2)));
        assert!(cache.contains(ExpertId::new(0, 0)));
        assert!(cache.contains(ExpertId::new(0, 1)));
    }

    #[test]
    fn auto_tune_clamps_to_device_budget() {
        let max_bytes = ExpertLruCache::auto_tune(2 * 1024 * 1024 * 1024, 512 * 1024 * 1024, 0.5);
        assert_eq!(max_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn stats_report_hit_rate() {
        let pool = CpuReferencePool::new();
        let mut cache = ExpertLruCache::new(1024);
        let (buf, len) = buffer(&pool, 64);
        cache.put(ExpertId::new(0, 0), buf, len);
        cache.get(ExpertId::new(0, 0));
        cache.get(ExpertId::new(1, 1));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }
}
