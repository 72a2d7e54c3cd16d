//! Loader State (spec §3 "Loader State", §4.8): owns every GPU-backed
//! weight a `load()` has produced — embeddings, per-layer weights, the
//! expert cache, and final weights — plus the set of buffer handles that
//! must be released on `clear()`/`unload()`. Clearing is transactional:
//! a failed load always ends with the state back at empty, never
//! half-populated (spec §4.9 `Rollback`).

use std::collections::HashMap;

use crate::expert_cache::ExpertLruCache;
use crate::gpu::{CpuWeightBuffer, GpuBufferHandle, GpuBufferPool, WeightBuffer};

/// Either a normal GPU-resident weight or, for oversized tensors exceeding
/// the device's buffer-binding limit, its host-resident counterpart
/// (spec §4.9 "Streaming rule").
pub enum LoadedWeight {
    Gpu(WeightBuffer),
    Cpu(CpuWeightBuffer),
}

impl LoadedWeight {
    pub fn gpu_buffer(&self) -> Option<GpuBufferHandle> {
        match self {
            LoadedWeight::Gpu(w) => Some(w.buffer),
            LoadedWeight::Cpu(_) => None,
        }
    }
}

/// One decoder layer's weights, keyed by the same logical names used by
/// `downcast::DOWNCAST_KEYS` plus norm weights.
#[derive(Default)]
pub struct LayerWeights {
    pub weights: HashMap<String, LoadedWeight>,
}

/// Everything a single `load()` call has materialized.
#[derive(Default)]
pub struct LoaderState {
    pub embeddings: HashMap<String, LoadedWeight>,
    pub layers: Vec<LayerWeights>,
    pub final_weights: HashMap<String, LoadedWeight>,
    pub expert_cache: Option<ExpertLruCache>,
    pub is_loaded: bool,
}

impl LoaderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called at the top of `load()`: if a previous load left state
    /// behind (e.g. a caller re-running `load()` without `unload()`),
    /// clear it first rather than leaking or silently overlapping it.
    pub fn prepare_for_load(&mut self, pool: &dyn GpuBufferPool) {
        if self.is_loaded || !self.embeddings.is_empty() || !self.layers.is_empty() {
            self.clear(pool);
        }
    }

    /// Release every GPU buffer this state owns and reset to empty.
    pub fn clear(&mut self, pool: &dyn GpuBufferPool) {
        for weight in self.embeddings.values() {
            release(weight, pool);
        }
        self.embeddings.clear();

        for layer in self.layers.drain(..) {
            for weight in layer.weights.values() {
                release(weight, pool);
            }
        }

        for weight in self.final_weights.values() {
            release(weight, pool);
        }
        self.final_weights.clear();

        if let Some(mut experts) = self.expert_cache.take() {
            experts.clear(pool);
        }

        self.is_loaded = false;
    }

    pub fn get_gpu_buffer(&self, weight: &LoadedWeight) -> Option<GpuBufferHandle> {
        weight.gpu_buffer()
    }

    pub fn is_gpu_backed(&self, weight: &LoadedWeight) -> bool {
        matches!(weight, LoadedWeight::Gpu(_))
    }
}

fn release(weight: &LoadedWeight, pool: &dyn GpuBufferPool) {
    if let LoadedWeight::Gpu(w) = weight {
        if let Err(err) = pool.release_buffer(w.buffer) {
            tracing::warn!(label = %w.label, error = %err, "failed to release weight buffer on clear");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{GpuDtype, Layout};
    use crate::gpu::{wrap_bytes, CpuReferencePool};

    fn gpu_weight(pool: &CpuReferencePool, label: &str) -> LoadedWeight {
        let handle = wrap_bytes(pool, &[0u8; 4], label).unwrap();
        LoadedWeight::Gpu(WeightBuffer {
            buffer: handle,
            dtype: GpuDtype::F32,
            layout: Layout::Row,
            shape: vec![1],
            label: label.to_string(),
        })
    }

    #[test]
    fn clear_releases_every_owned_buffer() {
        let pool = CpuReferencePool::new();
        let mut state = LoaderState::new();
        state.embeddings.insert("embed".into(), gpu_weight(&pool, "embed"));
        let mut layer = LayerWeights::default();
        layer.weights.insert("qProj".into(), gpu_weight(&pool, "qProj"));
        state.layers.push(layer);
        state.final_weights.insert("lmHead".into(), gpu_weight(&pool, "lmHead"));
        state.is_loaded = true;

        assert_eq!(pool.stats().live_buffers, 3);
        state.clear(&pool);
        assert_eq!(pool.stats().live_buffers, 0);
        assert!(!state.is_loaded);
        assert!(state.embeddings.is_empty());
        assert!(state.layers.is_empty());
    }

    #[test]
    fn prepare_for_load_clears_stale_state() {
        let pool = CpuReferencePool::new();
        let mut state = LoaderState::new();
        state.embeddings.insert("embed".into(), gpu_weight(&pool, "embed"));
        state.is_loaded = true;

        state.prepare_for_load(&pool);

        assert!(state.embeddings.is_empty());
        assert_eq!(pool.stats().live_buffers, 0);
    }

    #[test]
    fn cpu_backed_weight_has_no_gpu_buffer() {
        let tensor = candle_core::Tensor::zeros(&[1], candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
        let weight = LoadedWeight::Cpu(CpuWeightBuffer {
            data: tensor,
            dtype: GpuDtype::F32,
            layout: Layout::Row,
            shape: vec![1],
            label: "big".into(),
        });
        let state = LoaderState::new();
        assert!(!state.is_gpu_backed(&weight));
        assert!(state.get_gpu_buffer(&weight).is_none());
    }
}
