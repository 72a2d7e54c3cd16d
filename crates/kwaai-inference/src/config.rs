//! Configuration for the inference engine

use crate::DeviceType;
use serde::{Deserialize, Serialize};

/// Configuration for the inference engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Device to use for inference
    pub device: DeviceType,

    /// Maximum memory to use (in bytes)
    pub max_memory: usize,

    /// Model cache size (number of models to keep loaded)
    pub model_cache_size: usize,

    /// Prefer quantized models for lower memory usage
    pub prefer_quantized: bool,

    /// Maximum batch size
    pub max_batch_size: usize,

    /// Maximum sequence length
    pub max_seq_len: usize,

    /// Use flash attention if available
    pub use_flash_attention: bool,

    /// Number of threads for CPU inference
    pub num_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceType::detect_best(),
            max_memory: 4 * 1024 * 1024 * 1024, // 4GB default
            model_cache_size: 3,
            prefer_quantized: true,
            max_batch_size: 8,
            max_seq_len: 4096,
            use_flash_attention: true,
            num_threads: num_cpus::get(),
        }
    }
}

impl EngineConfig {
    /// Create configuration optimized for browser (WASM)
    pub fn browser_optimized() -> Self {
        Self {
            device: DeviceType::Cpu,
            max_memory: 1024 * 1024 * 1024, // 1GB
            model_cache_size: 1,
            prefer_quantized: true,
            max_batch_size: 1,
            max_seq_len: 2048,
            use_flash_attention: false,
            num_threads: 4,
        }
    }

    /// Create configuration optimized for mobile
    pub fn mobile_optimized() -> Self {
        Self {
            device: DeviceType::Cpu,
            max_memory: 512 * 1024 * 1024, // 512MB
            model_cache_size: 1,
            prefer_quantized: true,
            max_batch_size: 1,
            max_seq_len: 1024,
            use_flash_attention: false,
            num_threads: 2,
        }
    }

    /// Create configuration for server deployment
    pub fn server_optimized() -> Self {
        Self {
            device: DeviceType::detect_best(),
            max_memory: 32 * 1024 * 1024 * 1024, // 32GB
            model_cache_size: 10,
            prefer_quantized: false,
            max_batch_size: 32,
            max_seq_len: 8192,
            use_flash_attention: true,
            num_threads: num_cpus::get(),
        }
    }
}

fn num_cpus_get() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

mod num_cpus {
    pub fn get() -> usize {
        super::num_cpus_get()
    }
}

// ── Weight-loading pipeline configuration ───────────────────────────────────

/// Runtime knobs the weight loader honors, mirroring the config surface a
/// host application supplies (shard cache policy, memory pacing, expert
/// cache sizing, upcast/streaming rules).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    pub shard_cache: ShardCacheConfig,
    pub memory_management: MemoryManagementConfig,
    pub expert_cache: ExpertCacheConfig,
    /// Whether non-matmul F16 weights may be upcast to F32 at load time.
    /// Forbidden by default (spec §4.4).
    pub allow_f32_upcast_non_matmul: bool,
    pub large_weights: LargeWeightsConfig,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            shard_cache: ShardCacheConfig::default(),
            memory_management: MemoryManagementConfig::default(),
            expert_cache: ExpertCacheConfig::default(),
            allow_f32_upcast_non_matmul: false,
            large_weights: LargeWeightsConfig::default(),
        }
    }
}

/// Shard Cache policy knobs (spec §4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardCacheConfig {
    /// `maxEntries` for a dense model served from a local store.
    pub opfs_entries: usize,
    /// `maxEntries` for a dense model served over the network.
    pub network_entries: usize,
    /// Upper clamp on `maxEntries` for MoE models.
    pub moe_max_entries: usize,
    /// Verify each shard's digest against the manifest on fetch.
    pub verify_hashes: bool,
    /// Concurrency gate size; `0` disables the gate (no limit).
    pub max_concurrent_loads: usize,
}

impl Default for ShardCacheConfig {
    fn default() -> Self {
        Self {
            opfs_entries: 8,
            network_entries: 32,
            moe_max_entries: 64,
            verify_hashes: true,
            max_concurrent_loads: 4,
        }
    }
}

/// Pacing knobs for periodic shard-cache / GPU-queue flushing between
/// layers (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagementConfig {
    pub log_interval_ms: u64,
    pub flush_interval_layers: usize,
    pub flush_threshold_bytes: usize,
    pub gpu_queue_flush_layers: usize,
}

impl Default for MemoryManagementConfig {
    fn default() -> Self {
        Self {
            log_interval_ms: 2_000,
            flush_interval_layers: 4,
            flush_threshold_bytes: 512 * 1024 * 1024,
            gpu_queue_flush_layers: 2,
        }
    }
}

/// Expert LRU Cache sizing knobs (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpertCacheConfig {
    pub default_size_bytes: usize,
    pub max_buffer_percentage: f64,
    pub max_buffer_fallback_bytes: usize,
}

impl Default for ExpertCacheConfig {
    fn default() -> Self {
        Self {
            default_size_bytes: 2 * 1024 * 1024 * 1024,
            max_buffer_percentage: 0.5,
            max_buffer_fallback_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Streaming threshold rule for weights that would exceed a single GPU
/// buffer binding (spec §4.9 "Streaming rule").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LargeWeightsConfig {
    pub enabled: bool,
    /// Clamped to `[0.1, 1.0]` by the orchestrator when read.
    pub safety_ratio: f64,
    pub prefer_f16: bool,
}

impl Default for LargeWeightsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safety_ratio: 0.9,
            prefer_f16: true,
        }
    }
}

impl LargeWeightsConfig {
    /// `safety_ratio` clamped into the spec-mandated `[0.1, 1.0]` range.
    pub fn clamped_safety_ratio(&self) -> f64 {
        self.safety_ratio.clamp(0.1, 1.0)
    }
}
