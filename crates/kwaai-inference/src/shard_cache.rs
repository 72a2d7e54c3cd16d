//! Shard Cache (spec §4.1): bounded LRU over raw shard bytes with
//! in-flight request coalescing, a two-level priority concurrency gate,
//! optional hash verification, and optional ranged reads.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{LoaderError, LoaderResult};
use crate::manifest::Manifest;
use crate::storage::ShardStorageBackend;

/// Scheduling priority for a shard fetch (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// Where the most recent `load` for a shard was served from (caller
/// diagnostics only, not used for cache policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Ram,
    Backend,
}

#[derive(Debug, Clone, Copy)]
pub struct LastSource {
    pub source: Source,
    pub elapsed_ms: u64,
}

/// A global concurrency limit with two FIFO priority lanes. High drains
/// before low; a limit of zero makes the gate a no-op (spec §4.1).
struct ConcurrencyGate {
    limit: usize,
    state: Mutex<GateState>,
}

struct GateState {
    in_flight: usize,
    high: VecDeque<oneshot::Sender<()>>,
    low: VecDeque<oneshot::Sender<()>>,
}

/// RAII guard; releasing the gate slot happens on drop via a channel back
/// to the owning gate, but since the gate itself needs `&self` to hand the
/// slot to the next waiter, the guard instead calls back into the gate
/// through an `Arc` it holds.
pub struct GateTicket {
    gate: Option<Arc<ConcurrencyGate>>,
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            tokio::spawn(async move {
                gate.release().await;
            });
        }
    }
}

impl ConcurrencyGate {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(GateState {
                in_flight: 0,
                high: VecDeque::new(),
                low: VecDeque::new(),
            }),
        }
    }

    async fn acquire(self: &Arc<Self>, priority: Priority) -> GateTicket {
        if self.limit == 0 {
            return GateTicket { gate: None };
        }
        let rx = {
            let mut state = self.state.lock().await;
            if state.in_flight < self.limit {
                state.in_flight += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                match priority {
                    Priority::High => state.high.push_back(tx),
                    Priority::Low => state.low.push_back(tx),
                }
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            // Slot handed off directly by `release()`; `in_flight` is not
            // touched here since ownership transfers without a decrement.
            let _ = rx.await;
        }
        GateTicket {
            gate: Some(self.clone()),
        }
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        let next = state.high.pop_front().or_else(|| state.low.pop_front());
        match next {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => {
                state.in_flight = state.in_flight.saturating_sub(1);
            }
        }
    }
}

struct InFlight {
    waiters: Vec<oneshot::Sender<LoaderResult<Bytes>>>,
}

/// Bounded LRU over raw shard bytes (spec §4.1, §3 "Shard").
pub struct ShardCache {
    backend: Arc<dyn ShardStorageBackend>,
    gate: Arc<ConcurrencyGate>,
    entries: Mutex<IndexMap<usize, Bytes>>,
    in_flight: Mutex<HashMap<usize, InFlight>>,
    max_entries: Mutex<usize>,
    verify_hashes: bool,
    manifest: Mutex<Option<Arc<Manifest>>>,
    last_sources: Mutex<HashMap<usize, LastSource>>,
}

impl ShardCache {
    pub fn new(backend: Arc<dyn ShardStorageBackend>, max_concurrent_loads: usize) -> Self {
        Self {
            backend,
            gate: Arc::new(ConcurrencyGate::new(max_concurrent_loads)),
            entries: Mutex::new(IndexMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_entries: Mutex::new(32),
            verify_hashes: true,
            manifest: Mutex::new(None),
            last_sources: Mutex::new(HashMap::new()),
        }
    }

    /// `lastSource` of the most recent `load` for `shard_index` (spec §4.1).
    pub async fn last_source(&self, shard_index: usize) -> Option<LastSource> {
        self.last_sources.lock().await.get(&shard_index).copied()
    }

    pub fn with_verify_hashes(mut self, verify: bool) -> Self {
        self.verify_hashes = verify;
        self
    }

    /// `configureForModel` (spec §4.1): sets `maxEntries` by policy.
    pub async fn configure_for_model(
        &self,
        manifest: Arc<Manifest>,
        has_custom_loader: bool,
        opfs_entries: usize,
        network_entries: usize,
        moe_max_entries: usize,
    ) {
        let max_entries = if let Some(moe) = manifest.moe_config.as_ref().filter(|m| m.num_experts > 1) {
            (2 * moe.num_experts_per_token + 1).clamp(4, moe_max_entries)
        } else if has_custom_loader {
            network_entries
        } else {
            opfs_entries
        };
        *self.max_entries.lock().await = max_entries;
        *self.manifest.lock().await = Some(manifest);
    }

    pub async fn has(&self, shard_index: usize) -> bool {
        self.entries.lock().await.contains_key(&shard_index)
    }

    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.entries
            .lock()
            .await
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }

    /// `load(shard_index, {priority})` (spec §4.1).
    pub async fn load(&self, shard_index: usize, priority: Priority) -> LoaderResult<Bytes> {
        if let Some(bytes) = self.touch_hit(shard_index).await {
            debug!(shard_index, "shard cache hit");
            self.last_sources.lock().await.insert(
                shard_index,
                LastSource {
                    source: Source::Ram,
                    elapsed_ms: 0,
                },
            );
            return Ok(bytes);
        }

        // Coalesce concurrent misses for the same shard into one fetch.
        let rx = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(entry) = in_flight.get_mut(&shard_index) {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push(tx);
                Some(rx)
            } else {
                in_flight.insert(shard_index, InFlight { waiters: Vec::new() });
                None
            }
        };

        if let Some(rx) = rx {
            return rx
                .await
                .map_err(|_| LoaderError::BackendError(anyhow::anyhow!("shard fetch dropped")))?;
        }

        let result = self.fetch_and_insert(shard_index, priority).await;

        let waiters = self
            .in_flight
            .lock()
            .await
            .remove(&shard_index)
            .map(|e| e.waiters)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(clone_result(&result));
        }
        result
    }

    async fn touch_hit(&self, shard_index: usize) -> Option<Bytes> {
        let mut entries = self.entries.lock().await;
        let bytes = entries.shift_remove(&shard_index)?;
        entries.insert(shard_index, bytes.clone());
        Some(bytes)
    }

    async fn fetch_and_insert(&self, shard_index: usize, priority: Priority) -> LoaderResult<Bytes> {
        let _ticket = self.gate.acquire(priority).await;
        let bytes = self.backend.load_shard(shard_index).await?;

        if self.verify_hashes {
            if let Some(manifest) = self.manifest.lock().await.clone() {
                self.verify_shard(&manifest, shard_index, &bytes)?;
            }
        }

        self.insert(shard_index, bytes.clone()).await;
        self.last_sources.lock().await.insert(
            shard_index,
            LastSource {
                source: Source::Backend,
                elapsed_ms: 0,
            },
        );
        Ok(bytes)
    }

    fn verify_shard(&self, manifest: &Manifest, shard_index: usize, bytes: &Bytes) -> LoaderResult<()> {
        let shard = manifest.shards.get(shard_index).ok_or_else(|| {
            LoaderError::IntegrityError(format!("shard {shard_index} not declared in manifest"))
        })?;
        let algorithm = shard
            .hash_algorithm
            .as_deref()
            .unwrap_or(&manifest.hash_algorithm);
        let digest = self.backend.compute_hash(bytes, algorithm)?;
        if digest != shard.hash {
            return Err(LoaderError::IntegrityError(format!(
                "shard {shard_index} hash mismatch: expected {}, got {digest}",
                shard.hash
            )));
        }
        Ok(())
    }

    async fn insert(&self, shard_index: usize, bytes: Bytes) {
        let mut entries = self.entries.lock().await;
        entries.insert(shard_index, bytes);
        let max_entries = *self.max_entries.lock().await;
        while entries.len() > max_entries {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                debug!(evicted, "shard cache evicted oldest entry");
            } else {
                break;
            }
        }
    }

    /// `loadRange(shard_index, offset, length, {priority})` (spec §4.1).
    pub async fn load_range(
        &self,
        shard_index: usize,
        offset: u64,
        length: Option<u64>,
        priority: Priority,
    ) -> LoaderResult<Bytes> {
        if let Some(full) = self.touch_hit(shard_index).await {
            return slice_bytes(full, offset, length, shard_index);
        }
        if self.backend.supports_ranged_reads() {
            let _ticket = self.gate.acquire(priority).await;
            return self
                .backend
                .load_shard_range(shard_index, offset, length)
                .await;
        }
        let full = self.load(shard_index, priority).await?;
        slice_bytes(full, offset, length, shard_index)
    }

    /// `prefetch(shard_index)`: fire-and-forget low-priority load.
    pub fn prefetch(self: &Arc<Self>, shard_index: usize) {
        let cache = self.clone_handle();
        tokio::spawn(async move {
            if let Err(err) = cache.load(shard_index, Priority::Low).await {
                warn!(shard_index, %err, "prefetch failed");
            }
        });
    }

    fn clone_handle(self: &Arc<Self>) -> Arc<Self> {
        self.clone()
    }

    /// `clear()`: drops all entries; safe at any time. In-flight loads
    /// continue and their results bypass the cache (they were already
    /// removed from `entries` conceptually by not being in it yet).
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

fn slice_bytes(full: Bytes, offset: u64, length: Option<u64>, shard_index: usize) -> LoaderResult<Bytes> {
    let offset = offset as usize;
    let end = match length {
        Some(len) => offset + len as usize,
        None => full.len(),
    };
    if end > full.len() {
        return Err(LoaderError::ShardTooSmall {
            shard: shard_index,
            needed: end,
            have: full.len(),
        });
    }
    Ok(full.slice(offset..end))
}

fn clone_result(result: &LoaderResult<Bytes>) -> LoaderResult<Bytes> {
    match result {
        Ok(bytes) => Ok(bytes.clone()),
        Err(err) => Err(LoaderError::BackendError(anyhow::anyhow!(err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend_with_shard(index: usize, data: &'static [u8]) -> Arc<InMemoryStorageBackend> {
        Arc::new(InMemoryStorageBackend::new().with_shard(index, Bytes::from_static(data)))
    }

    #[tokio::test]
    async fn hit_returns_same_bytes_and_updates_lru_order() {
        let backend = backend_with_shard(0, b"hello");
        let cache = ShardCache::new(backend, 4);
        let first = cache.load(0, Priority::High).await.unwrap();
        let second = cache.load(0, Priority::High).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.size().await, 1);
        assert_eq!(cache.last_source(0).await.unwrap().source, Source::Ram);
    }

    #[tokio::test]
    async fn eviction_drops_oldest_entry_past_max_entries() {
        let backend = Arc::new(
            InMemoryStorageBackend::new()
                .with_shard(0, Bytes::from_static(b"a"))
                .with_shard(1, Bytes::from_static(b"b"))
                .with_shard(2, Bytes::from_static(b"c")),
        );
        let cache = ShardCache::new(backend, 4);
        *cache.max_entries.lock().await = 2;
        cache.load(0, Priority::High).await.unwrap();
        cache.load(1, Priority::High).await.unwrap();
        cache.load(2, Priority::High).await.unwrap();
        assert_eq!(cache.size().await, 2);
        assert!(!cache.has(0).await);
        assert!(cache.has(2).await);
    }

    #[tokio::test]
    async fn concurrent_loads_for_same_shard_dedupe_to_one_backend_call() {
        struct CountingBackend {
            inner: InMemoryStorageBackend,
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl ShardStorageBackend for CountingBackend {
            async fn init_storage(&self) -> LoaderResult<()> {
                self.inner.init_storage().await
            }
            async fn open_model_store(&self, model_id: &str) -> LoaderResult<()> {
                self.inner.open_model_store(model_id).await
            }
            async fn load_manifest_from_store(&self) -> LoaderResult<String> {
                self.inner.load_manifest_from_store().await
            }
            async fn load_tensors_from_store(&self) -> LoaderResult<String> {
                self.inner.load_tensors_from_store().await
            }
            async fn load_shard(&self, index: usize) -> LoaderResult<Bytes> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                self.inner.load_shard(index).await
            }
            async fn load_shard_range(
                &self,
                index: usize,
                offset: u64,
                length: Option<u64>,
            ) -> LoaderResult<Bytes> {
                self.inner.load_shard_range(index, offset, length).await
            }
            fn supports_ranged_reads(&self) -> bool {
                self.inner.supports_ranged_reads()
            }
            async fn verify_integrity(&self) -> LoaderResult<crate::storage::IntegrityReport> {
                self.inner.verify_integrity().await
            }
            fn compute_hash(&self, bytes: &[u8], algorithm: &str) -> LoaderResult<String> {
                self.inner.compute_hash(bytes, algorithm)
            }
            fn backend_type(&self) -> &'static str {
                "counting"
            }
        }

        let backend = Arc::new(CountingBackend {
            inner: InMemoryStorageBackend::new().with_shard(5, Bytes::from_static(b"xyz")),
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ShardCache::new(backend.clone(), 4).with_verify_hashes(false));

        let c1 = cache.clone();
        let c2 = cache.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { c1.load(5, Priority::High).await }),
            tokio::spawn(async move { c2.load(5, Priority::High).await }),
        );
        assert_eq!(r1.unwrap().unwrap(), r2.unwrap().unwrap());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn moe_with_one_expert_per_token_clamps_to_four() {
        let backend = backend_with_shard(0, b"x");
        let cache = ShardCache::new(backend, 4);
        let manifest = Arc::new(Manifest {
            shards: vec![],
            hash_algorithm: "sha256".into(),
            tensors_file: None,
            tensors: None,
            config: crate::manifest::ModelArchConfig::default(),
            moe_config: Some(crate::manifest::MoeConfig {
                num_experts: 8,
                num_experts_per_token: 1,
                expert_format: crate::manifest::ExpertFormat::Mixtral,
            }),
            inference: crate::manifest::InferenceConfig::default(),
            q4k_layout: None,
            expert_bytes: None,
            expert_shard_map: HashMap::new(),
            expert_tensor_map: HashMap::new(),
        });
        cache.configure_for_model(manifest, false, 8, 32, 64).await;
        assert_eq!(*cache.max_entries.lock().await, 4);
    }

    #[tokio::test]
    async fn zero_concurrency_limit_disables_gate() {
        let backend = backend_with_shard(0, b"data");
        let cache = ShardCache::new(backend, 0);
        let bytes = cache.load(0, Priority::High).await.unwrap();
        assert_eq!(&bytes[..], b"data");
    }

    #[tokio::test]
    async fn load_range_out_of_bounds_on_cached_entry_errors() {
        let backend = backend_with_shard(0, b"01234");
        let cache = ShardCache::new(backend, 4);
        cache.load(0, Priority::High).await.unwrap();
        let err = cache
            .load_range(0, 2, Some(10), Priority::High)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::ShardTooSmall { .. }));
    }

    #[tokio::test]
    async fn hash_mismatch_is_integrity_error() {
        let backend = backend_with_shard(0, b"data");
        let cache = ShardCache::new(backend, 4);
        let manifest = Arc::new(Manifest {
            shards: vec![crate::manifest::ShardInfo {
                size: 4,
                hash: "deadbeef".into(),
                hash_algorithm: None,
            }],
            hash_algorithm: "sha256".into(),
            tensors_file: None,
            tensors: None,
            config: crate::manifest::ModelArchConfig::default(),
            moe_config: None,
            inference: crate::manifest::InferenceConfig::default(),
            q4k_layout: None,
            expert_bytes: None,
            expert_shard_map: HashMap::new(),
            expert_tensor_map: HashMap::new(),
        });
        cache.configure_for_model(manifest, false, 8, 32, 64).await;
        let err = cache.load(0, Priority::High).await.unwrap_err();
        assert!(matches!(err, LoaderError::IntegrityError(_)));
    }
}
