//! Orchestrator (spec §4.9): the `load()` pipeline that drives every
//! other component in this crate — Tensor Location Index, Tensor Reader,
//! Shard Cache, Tensor Loader, Loader State, and Expert LRU Cache — through
//! the state machine:
//!
//! ```text
//! Idle -> Init -> CheckState -> OpenStorage -> ParseManifest -> Validate
//!      -> IntegrityCheck -> BuildTensorIndex -> LoadEmbeddings
//!      -> LoadLayers (loop L) -> LoadFinalWeights -> Complete
//! ```
//!
//! Any phase failure rolls back through `unload()` before the error is
//! rethrown — a failed `load()` never leaves partial GPU state behind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::LoadingConfig;
use crate::downcast::downcast_layer_weights;
use crate::dtype::TensorRole;
use crate::error::{LoaderError, LoaderResult};
use crate::expert_cache::{ExpertId, ExpertLruCache};
use crate::gpu::{CpuWeightBuffer, GpuBufferPool, GpuDevice, GpuKernels, WeightBuffer};
use crate::loader_state::{LayerWeights, LoaderState, LoadedWeight};
use crate::manifest::{ExpertFormat, Manifest, ManifestParser, ModelArchConfig, TensorLocation};
use crate::memory_monitor::MemoryMonitor;
use crate::norm_offset::apply_offset;
use crate::progress::{ProgressCallback, ProgressEvent, ProgressReporter, ProgressStage};
use crate::shard_cache::{Priority, ShardCache};
use crate::storage::ShardStorageBackend;
use crate::tensor_index::TensorLocationIndex;
use crate::tensor_loader::{load_tensor_gpu, TensorLoaderConfig};
use crate::tensor_reader::read_tensor;

/// The state-machine phase the orchestrator is currently in (spec §4.9).
/// Exposed for diagnostics; callers drive phases only indirectly through
/// [`Loader::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderPhase {
    Idle,
    Init,
    ParseManifest,
    IntegrityCheck,
    BuildTensorIndex,
    LoadEmbeddings,
    LoadLayers,
    LoadFinalWeights,
    Complete,
}

/// Layer-local name resolution prefixes (spec §4.9 `LoadLayer`).
const LAYER_PREFIXES: &[&str] = &[
    "language_model.model.layers.{l}.",
    "model.layers.{l}.",
    "layers.{l}.",
    "blk.{l}.",
];

fn candidates(layer: usize, suffixes: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(LAYER_PREFIXES.len() * suffixes.len());
    for prefix in LAYER_PREFIXES {
        let prefix = prefix.replace("{l}", &layer.to_string());
        for suffix in suffixes {
            out.push(format!("{prefix}{suffix}"));
        }
    }
    out
}

/// Caller-facing load statistics (spec §6 `getStats`).
#[derive(Debug, Clone, Default)]
pub struct LoaderStats {
    pub is_loaded: bool,
    pub layers_loaded: usize,
    pub shard_cache_entries: usize,
    pub shard_cache_bytes: u64,
}

/// Drives the full weight-loading pipeline (spec §4.9). Generic over the
/// GPU collaborators so a production host can supply real WebGPU-backed
/// implementations while tests use the `CpuReference*` types from `gpu`.
pub struct Loader {
    parser: Arc<dyn ManifestParser>,
    device: Arc<dyn GpuDevice>,
    pool: Arc<dyn GpuBufferPool>,
    kernels: Arc<dyn GpuKernels>,

    loading_config: LoadingConfig,
    tensor_loader_config: TensorLoaderConfig,

    /// Set via `setManifest` — bypasses `ParseManifest`'s backend fetch and
    /// survives the `unload()` wipe in `CheckState` (spec §4.9 "preserving
    /// an externally-set manifest across the wipe").
    external_manifest: Option<Manifest>,
    custom_shard_loader: bool,
    tensors_json_url: Option<String>,
    /// Caller-provided `q4kLayout` override from `setQ4KConfig` (spec §6);
    /// wins over the manifest's own `q4kLayout` when set.
    q4k_layout_override: Option<crate::manifest::Q4KLayout>,

    phase: LoaderPhase,
    manifest: Option<Arc<Manifest>>,
    tensor_index: Option<TensorLocationIndex>,
    shard_cache: Option<Arc<ShardCache>>,
    state: LoaderState,
    memory_monitor: MemoryMonitor,
}

impl Loader {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        pool: Arc<dyn GpuBufferPool>,
        kernels: Arc<dyn GpuKernels>,
        parser: Arc<dyn ManifestParser>,
        loading_config: LoadingConfig,
    ) -> Self {
        Self {
            parser,
            device,
            pool,
            kernels,
            loading_config,
            tensor_loader_config: TensorLoaderConfig::default(),
            external_manifest: None,
            custom_shard_loader: false,
            tensors_json_url: None,
            q4k_layout_override: None,
            phase: LoaderPhase::Idle,
            manifest: None,
            tensor_index: None,
            shard_cache: None,
            state: LoaderState::new(),
            memory_monitor: MemoryMonitor::new(64),
        }
    }

    pub fn phase(&self) -> LoaderPhase {
        self.phase
    }

    /// `init()` (spec §4.9 **Init**): detect GPU capabilities, acquire the
    /// device.
    pub fn init(&mut self) -> LoaderResult<()> {
        self.phase = LoaderPhase::Init;
        self.device.init_device()?;
        self.tensor_loader_config.gpu_capabilities = self.device.capabilities();
        self.phase = LoaderPhase::Idle;
        Ok(())
    }

    /// `setManifest(manifest)` (spec §6): used by hosts with a custom
    /// shard loader that has no storage backend of its own to parse a
    /// manifest from.
    pub fn set_manifest(&mut self, manifest: Manifest) {
        self.external_manifest = Some(manifest);
    }

    pub fn set_custom_shard_loader(&mut self, enabled: bool) {
        self.custom_shard_loader = enabled;
    }

    /// `setTensorsJsonUrl(url?)` (spec §6): when set, `BuildTensorIndex`
    /// fetches the tensor map from this URL instead of the manifest's
    /// inline table or `tensorsFile`. Passing `None` clears the override.
    pub fn set_tensors_json_url(&mut self, url: Option<String>) {
        self.tensors_json_url = url;
    }

    pub fn set_loading_config(&mut self, config: LoadingConfig) {
        self.loading_config = config;
    }

    /// `setQ4KConfig({useFusedQ4K, q4kLayout, keepF32Weights})` (spec §6).
    /// `q4k_layout`, when `Some`, overrides the manifest's own `q4kLayout`
    /// for the next `load()` (re-applied during `ParseManifest`).
    pub fn set_q4k_config(
        &mut self,
        use_fused_q4k: bool,
        q4k_layout: Option<crate::manifest::Q4KLayout>,
        keep_f32_weights: bool,
    ) {
        self.tensor_loader_config.use_fused_q4k = use_fused_q4k;
        self.tensor_loader_config.keep_f32_weights = keep_f32_weights;
        self.q4k_layout_override = q4k_layout;
        self.tensor_loader_config.q4k_layout = q4k_layout;
    }

    pub fn get_config(&self) -> &LoadingConfig {
        &self.loading_config
    }

    pub fn get_stats(&self) -> LoaderStats {
        LoaderStats {
            is_loaded: self.state.is_loaded,
            layers_loaded: self.state.layers.len(),
            shard_cache_entries: 0,
            shard_cache_bytes: 0,
        }
    }

    pub fn get_expert_cache_stats(&self) -> Option<crate::expert_cache::ExpertCacheStats> {
        self.state.expert_cache.as_ref().map(|c| c.stats())
    }

    /// True once a successful `load()` has completed and no error has
    /// since forced a rollback.
    pub fn can_run_dense(&self) -> bool {
        self.state.is_loaded && !self.manifest.as_ref().is_some_and(|m| m.is_moe())
    }

    pub fn get_layer_weights(&self, layer: usize) -> Option<&LayerWeights> {
        self.state.layers.get(layer)
    }

    /// `unload()` (spec §4.8): release every tracked GPU buffer, clear the
    /// shard cache, reset to `Idle`. Idempotent — a second call is a no-op.
    pub async fn unload(&mut self) {
        self.state.clear(self.pool.as_ref());
        if let Some(cache) = &self.shard_cache {
            cache.clear().await;
        }
        self.manifest = None;
        self.tensor_index = None;
        self.phase = LoaderPhase::Idle;
    }

    /// `load(modelId, options)` (spec §4.9): the full pipeline. On any
    /// phase failure, rolls back via `unload()` (preserving
    /// `external_manifest`) and rethrows.
    pub async fn load(
        &mut self,
        model_id: &str,
        backend: Arc<dyn ShardStorageBackend>,
        progress: Option<&ProgressCallback<'_>>,
    ) -> LoaderResult<ModelArchConfig> {
        match self.load_inner(model_id, backend, progress).await {
            Ok(config) => Ok(config),
            Err(err) => {
                self.unload().await;
                Err(err)
            }
        }
    }

    async fn load_inner(
        &mut self,
        model_id: &str,
        backend: Arc<dyn ShardStorageBackend>,
        progress: Option<&ProgressCallback<'_>>,
    ) -> LoaderResult<ModelArchConfig> {
        // CheckState: wipe any prior load, preserving `external_manifest`.
        if self.state.is_loaded || !self.state.embeddings.is_empty() {
            self.unload().await;
        }

        // ParseManifest.
        self.phase = LoaderPhase::ParseManifest;
        if let Some(cb) = progress {
            cb(ProgressEvent {
                stage: ProgressStage::ParseManifest,
                percent: 0.0,
                message: Some("parsing manifest".into()),
            });
        }
        backend.init_storage().await?;
        backend.open_model_store(model_id).await?;

        let manifest = match self.external_manifest.clone() {
            Some(m) => m,
            None => {
                let json = backend.load_manifest_from_store().await?;
                self.parser.parse_manifest(&json)?
            }
        };
        manifest.validate()?;
        // Manifest `q4kLayout` governs the fused-vs-dequant Q4K dispatch
        // (spec §3, §4.4); an explicit `setQ4KConfig` override takes
        // priority when the caller provided one.
        self.tensor_loader_config.q4k_layout =
            self.q4k_layout_override.or(manifest.q4k_layout);
        let manifest = Arc::new(manifest);
        self.manifest = Some(manifest.clone());
        if let Some(cb) = progress {
            ProgressReporter::new(cb, ProgressStage::ParseManifest).done("manifest parsed");
        }

        let shard_cache = Arc::new(
            ShardCache::new(backend.clone(), self.loading_config.shard_cache.max_concurrent_loads)
                .with_verify_hashes(self.loading_config.shard_cache.verify_hashes),
        );
        shard_cache
            .configure_for_model(
                manifest.clone(),
                self.custom_shard_loader,
                self.loading_config.shard_cache.opfs_entries,
                self.loading_config.shard_cache.network_entries,
                self.loading_config.shard_cache.moe_max_entries,
            )
            .await;
        self.shard_cache = Some(shard_cache.clone());

        // IntegrityCheck.
        self.phase = LoaderPhase::IntegrityCheck;
        if self.loading_config.shard_cache.verify_hashes {
            let report = backend.verify_integrity().await?;
            if !report.valid {
                return Err(LoaderError::IntegrityError(format!(
                    "missing shards {:?}, corrupt shards {:?}",
                    report.missing_shards, report.corrupt_shards
                )));
            }
        }
        if let Some(cb) = progress {
            ProgressReporter::new(cb, ProgressStage::IntegrityCheck).done("integrity verified");
        }

        // BuildTensorIndex.
        self.phase = LoaderPhase::BuildTensorIndex;
        let tensor_index = TensorLocationIndex::build(
            &manifest,
            backend.as_ref(),
            self.parser.as_ref(),
            self.tensors_json_url.as_deref(),
        )
        .await?;
        if let Some(cb) = progress {
            ProgressReporter::new(cb, ProgressStage::BuildTensorIndex).done("tensor index built");
        }

        // Expert cache, sized by autoTune (spec §4.7) when it's a MoE model.
        if manifest.is_moe() {
            let cfg = &self.loading_config.expert_cache;
            let max_bytes = ExpertLruCache::auto_tune(
                cfg.default_size_bytes as u64,
                self.device.max_buffer_size(),
                cfg.max_buffer_percentage,
            );
            let max_bytes = if max_bytes == 0 {
                cfg.max_buffer_fallback_bytes as u64
            } else {
                max_bytes
            };
            self.state.expert_cache = Some(ExpertLruCache::new(max_bytes));
        }

        // LoadEmbeddings.
        self.phase = LoaderPhase::LoadEmbeddings;
        let embedding_name = tensor_index
            .names_with_role(&TensorRole::Embedding, Some("embed"))
            .next()
            .or_else(|| tensor_index.names_with_role(&TensorRole::Embedding, None).next())
            .map(|s| s.to_string())
            .ok_or_else(|| LoaderError::TensorNotFound("no embedding tensor found".into()))?;
        let embedding_weight = self
            .load_named_weight(&embedding_name, &tensor_index, &shard_cache, Priority::High)
            .await?;
        if let LoadedWeight::Gpu(buf) = &embedding_weight {
            if buf.dtype == crate::dtype::GpuDtype::F32
                && self.tensor_loader_config.gpu_capabilities.has_f16
                && !self.tensor_loader_config.keep_f32_weights
            {
                let mut map = HashMap::new();
                map.insert("embed".to_string(), buf.clone());
                downcast_layer_weights(&mut map, true, false, self.pool.as_ref(), self.kernels.as_ref());
                self.state.embeddings.insert(embedding_name.clone(), LoadedWeight::Gpu(map.remove("embed").unwrap()));
            } else {
                self.state.embeddings.insert(embedding_name.clone(), embedding_weight);
            }
        } else {
            self.state.embeddings.insert(embedding_name.clone(), embedding_weight);
        }
        if let Some(cb) = progress {
            ProgressReporter::new(cb, ProgressStage::LoadEmbeddings).done("embeddings loaded");
        }

        // LoadLayers.
        self.phase = LoaderPhase::LoadLayers;
        let num_layers = manifest
            .config
            .num_hidden_layers()
            .ok_or_else(|| LoaderError::ConfigMissing("num_hidden_layers not present in config".into()))?;
        let is_moe = manifest.is_moe();
        let layer_reporter = progress.map(|cb| ProgressReporter::new(cb, ProgressStage::LoadLayers));
        for layer in 0..num_layers {
            let weights = self
                .load_layer(layer, is_moe, &tensor_index, &shard_cache)
                .await?;
            self.state.layers.push(weights);

            if let Some(reporter) = &layer_reporter {
                reporter.fraction(layer + 1, num_layers);
            }

            // Periodic flush (spec §4.9): only meaningful for a local
            // store, where refetch is cheap; skipped for custom loaders.
            let flush_layers = self.loading_config.memory_management.flush_interval_layers;
            let flush_bytes = self.loading_config.memory_management.flush_threshold_bytes as u64;
            if !self.custom_shard_loader
                && flush_layers > 0
                && ((layer + 1) % flush_layers == 0 || shard_cache.total_bytes().await > flush_bytes)
            {
                shard_cache.clear().await;
            }
            tokio::task::yield_now().await;
        }

        // LoadFinalWeights.
        self.phase = LoaderPhase::LoadFinalWeights;
        self.load_final_weights(&manifest, &tensor_index, &shard_cache).await?;
        if let Some(cb) = progress {
            ProgressReporter::new(cb, ProgressStage::LoadFinalWeights).done("final weights loaded");
        }

        // Complete.
        self.phase = LoaderPhase::Complete;
        self.state.is_loaded = true;
        shard_cache.clear().await;
        if let Some(cb) = progress {
            cb(ProgressEvent {
                stage: ProgressStage::Complete,
                percent: 100.0,
                message: Some("load complete".into()),
            });
        }

        Ok(manifest.config.clone())
    }

    /// Load one named tensor end to end (Tensor Index -> Tensor Reader ->
    /// Tensor Loader), honoring the streaming rule (spec §4.9).
    async fn load_named_weight(
        &self,
        name: &str,
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
        priority: Priority,
    ) -> LoaderResult<LoadedWeight> {
        let location = tensor_index
            .get(name)
            .ok_or_else(|| LoaderError::TensorNotFound(name.to_string()))?;
        self.load_location(location, name, shard_cache, priority).await
    }

    async fn load_location(
        &self,
        location: &TensorLocation,
        name: &str,
        shard_cache: &Arc<ShardCache>,
        priority: Priority,
    ) -> LoaderResult<LoadedWeight> {
        let bytes = read_tensor(shard_cache, location, priority).await?;

        if self.loading_config.large_weights.enabled {
            if let Some(cpu_buffer) = self.try_stream_to_cpu(&bytes, location, name)? {
                return Ok(LoadedWeight::Cpu(cpu_buffer));
            }
        }

        let buffer = load_tensor_gpu(
            &bytes,
            location,
            name,
            &self.tensor_loader_config,
            self.pool.as_ref(),
            self.kernels.as_ref(),
        )?;
        Ok(LoadedWeight::Gpu(buffer))
    }

    /// Streaming rule (spec §4.9): if the tensor's intended runtime byte
    /// size exceeds `floor(min(maxStorageBufferBindingSize, maxBufferSize)
    /// * safetyRatio)`, it must be loaded as a `CpuWeightBuffer` instead of
    /// a GPU buffer — but only for float source dtypes; quantized dtypes
    /// cannot stream and fail the load with `BudgetExceeded`.
    fn try_stream_to_cpu(
        &self,
        bytes: &[u8],
        location: &TensorLocation,
        name: &str,
    ) -> LoaderResult<Option<CpuWeightBuffer>> {
        let safety_ratio = self.loading_config.large_weights.clamped_safety_ratio();
        let threshold = (self
            .device
            .max_storage_buffer_binding_size()
            .min(self.device.max_buffer_size()) as f64
            * safety_ratio)
            .floor() as u64;

        let runtime_bytes = estimated_runtime_bytes(location);
        if runtime_bytes <= threshold {
            return Ok(None);
        }

        use crate::dtype::Dtype;
        match location.dtype {
            Dtype::F16 | Dtype::F32 | Dtype::Bf16 => {
                let dtype = match location.dtype {
                    Dtype::F16 => candle_core::DType::F16,
                    Dtype::Bf16 => candle_core::DType::BF16,
                    _ => candle_core::DType::F32,
                };
                let tensor = crate::gpu::bytes_to_f32_tensor(bytes, &location.shape, dtype)?;
                Ok(Some(CpuWeightBuffer {
                    data: tensor,
                    dtype: crate::dtype::GpuDtype::F32,
                    layout: crate::tensor_loader::resolve_layout(location),
                    shape: location.shape.clone(),
                    label: name.to_string(),
                }))
            }
            _ => Err(LoaderError::BudgetExceeded(format!(
                "{name} exceeds the GPU buffer budget ({runtime_bytes} > {threshold} bytes) and its \
                 dtype cannot be streamed; re-quantize to a smaller variant or raise \
                 inference.largeWeights.safetyRatio"
            ))),
        }
    }

    async fn load_layer(
        &self,
        layer: usize,
        is_moe: bool,
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
    ) -> LoaderResult<LayerWeights> {
        let mut weights = LayerWeights::default();

        for (key, suffixes) in [
            ("inputLayerNorm", &["input_layernorm.weight", "attn_norm.weight"][..]),
            ("postAttentionNorm", &["post_attention_layernorm.weight"][..]),
            ("qNorm", &["self_attn.q_norm.weight"][..]),
            ("kNorm", &["self_attn.k_norm.weight"][..]),
            ("preFeedforwardNorm", &["pre_feedforward_layernorm.weight"][..]),
            ("postFeedforwardNorm", &["post_feedforward_layernorm.weight"][..]),
        ] {
            self.try_load_optional(key, layer, suffixes, tensor_index, shard_cache, &mut weights, true)
                .await?;
        }

        for (key, suffixes) in [
            ("qProj", &["self_attn.q_proj.weight", "attn.wq.weight"][..]),
            ("kProj", &["self_attn.k_proj.weight", "attn.wk.weight"][..]),
            ("vProj", &["self_attn.v_proj.weight", "attn.wv.weight"][..]),
            ("oProj", &["self_attn.o_proj.weight", "attn.wo.weight"][..]),
        ] {
            self.require_layer_tensor(key, layer, suffixes, tensor_index, shard_cache, &mut weights)
                .await?;
        }

        self.try_load_optional(
            "attentionSinks",
            layer,
            &["self_attn.sinks"],
            tensor_index,
            shard_cache,
            &mut weights,
            true,
        )
        .await?;

        if is_moe {
            self.require_layer_tensor(
                "routerWeight",
                layer,
                &["block_sparse_moe.gate.weight", "mlp.router.weight"],
                tensor_index,
                shard_cache,
                &mut weights,
            )
            .await?;
            self.try_load_optional(
                "routerBias",
                layer,
                &["mlp.router.bias"],
                tensor_index,
                shard_cache,
                &mut weights,
                true,
            )
            .await?;
        } else {
            let has_fused = self
                .try_load_optional(
                    "ffnGateUp",
                    layer,
                    &["mlp.gate_up_proj.weight"],
                    tensor_index,
                    shard_cache,
                    &mut weights,
                    true,
                )
                .await?;
            if !has_fused {
                self.require_layer_tensor(
                    "ffnGate",
                    layer,
                    &["mlp.gate_proj.weight", "feed_forward.w1.weight"],
                    tensor_index,
                    shard_cache,
                    &mut weights,
                )
                .await?;
                self.require_layer_tensor(
                    "ffnUp",
                    layer,
                    &["mlp.up_proj.weight", "feed_forward.w3.weight"],
                    tensor_index,
                    shard_cache,
                    &mut weights,
                )
                .await?;
            }
            self.require_layer_tensor(
                "ffnDown",
                layer,
                &["mlp.down_proj.weight", "feed_forward.w2.weight"],
                tensor_index,
                shard_cache,
                &mut weights,
            )
            .await?;
        }

        let mut gpu_only: HashMap<String, WeightBuffer> = weights
            .weights
            .iter()
            .filter_map(|(k, w)| match w {
                LoadedWeight::Gpu(buf) => Some((k.clone(), buf.clone())),
                LoadedWeight::Cpu(_) => None,
            })
            .collect();
        downcast_layer_weights(
            &mut gpu_only,
            self.tensor_loader_config.gpu_capabilities.has_f16,
            self.tensor_loader_config.keep_f32_weights,
            self.pool.as_ref(),
            self.kernels.as_ref(),
        );
        for (key, buf) in gpu_only {
            weights.weights.insert(key, LoadedWeight::Gpu(buf));
        }

        Ok(weights)
    }

    async fn require_layer_tensor(
        &self,
        key: &str,
        layer: usize,
        suffixes: &[&str],
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
        weights: &mut LayerWeights,
    ) -> LoaderResult<()> {
        if self
            .try_load_optional(key, layer, suffixes, tensor_index, shard_cache, weights, false)
            .await?
        {
            Ok(())
        } else {
            Err(LoaderError::TensorNotFound(format!(
                "layer {layer}: required tensor '{key}' not found under any of {suffixes:?}"
            )))
        }
    }

    /// Resolve a layer-local logical name against the prefix/suffix
    /// candidate grid, load it if found, and apply the norm-offset
    /// transform when the key names a norm tensor. Returns whether the
    /// tensor was found — callers for required tensors turn `false` into
    /// `TensorNotFound`; callers for optional ones just skip it.
    async fn try_load_optional(
        &self,
        key: &str,
        layer: usize,
        suffixes: &[&str],
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
        weights: &mut LayerWeights,
        is_norm: bool,
    ) -> LoaderResult<bool> {
        let names = candidates(layer, suffixes);
        let Some(resolved) = tensor_index.resolve_first(names.iter().map(|s| s.as_str())) else {
            return Ok(false);
        };
        let loaded = self
            .load_named_weight(&resolved, tensor_index, shard_cache, Priority::High)
            .await?;
        if is_norm {
            if let LoadedWeight::Gpu(buf) = &loaded {
                if self.manifest.as_ref().is_some_and(|m| m.rms_norm_weight_offset().unwrap_or(false)) {
                    apply_offset(buf, self.pool.as_ref(), self.kernels.as_ref())?;
                }
            }
        }
        weights.weights.insert(key.to_string(), loaded);
        Ok(true)
    }

    async fn load_final_weights(
        &mut self,
        manifest: &Arc<Manifest>,
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
    ) -> LoaderResult<()> {
        let norm_candidates = ["model.norm.weight", "norm.weight", "language_model.model.norm.weight"];
        if let Some(name) = tensor_index.resolve_first(norm_candidates) {
            let weight = self.load_named_weight(&name, tensor_index, shard_cache, Priority::High).await?;
            if let LoadedWeight::Gpu(buf) = &weight {
                if manifest.rms_norm_weight_offset()? {
                    apply_offset(buf, self.pool.as_ref(), self.kernels.as_ref())?;
                }
            }
            self.state.final_weights.insert("finalNorm".to_string(), weight);
        } else {
            return Err(LoaderError::TensorNotFound("final norm tensor not found".into()));
        }

        let lm_head_candidates = ["lm_head.weight", "language_model.lm_head.weight"];
        let tied = manifest.tie_word_embeddings()?;
        match tensor_index.resolve_first(lm_head_candidates) {
            Some(name) => {
                let mut weight = self.load_named_weight(&name, tensor_index, shard_cache, Priority::High).await?;
                if let LoadedWeight::Gpu(buf) = &weight {
                    if buf.dtype == crate::dtype::GpuDtype::F32
                        && self.tensor_loader_config.gpu_capabilities.has_f16
                        && !tied
                    {
                        let mut map = HashMap::new();
                        map.insert("lmHead".to_string(), buf.clone());
                        downcast_layer_weights(&mut map, true, false, self.pool.as_ref(), self.kernels.as_ref());
                        weight = LoadedWeight::Gpu(map.remove("lmHead").unwrap());
                    }
                }
                self.state.final_weights.insert("lmHead".to_string(), weight);
            }
            None if tied => {
                tracing::debug!("lm_head absent, aliasing tied embeddings");
            }
            None => {
                tracing::warn!("lm_head absent and embeddings are not tied; generation will be degraded");
            }
        }
        Ok(())
    }

    /// `loadExpert(layer, expert)` (spec §4.9 **LoadExpert**). Checks the
    /// LRU first; on miss, loads the expert's tensors per
    /// `moeConfig.expertFormat` and `put`s the result into the LRU.
    pub async fn load_expert(
        &mut self,
        layer: usize,
        expert: usize,
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
    ) -> LoaderResult<()> {
        let id = ExpertId::new(layer, expert);
        if self.state.expert_cache.as_mut().is_some_and(|c| c.get(id).is_some()) {
            return Ok(());
        }

        let manifest = self.manifest.clone().ok_or(LoaderError::ConfigMissing("no manifest loaded".into()))?;
        let moe = manifest
            .moe_config
            .as_ref()
            .ok_or_else(|| LoaderError::ConfigMissing("moeConfig missing".into()))?;

        for shard in manifest.shards_for_expert(layer, expert) {
            let _ = shard_cache.load(shard, Priority::High).await;
        }

        let buffers = match moe.expert_format {
            ExpertFormat::Mixtral => self.load_mixtral_expert(layer, expert, tensor_index, shard_cache).await?,
            ExpertFormat::GptOss => {
                // Packed per-layer block shared across the layer's experts;
                // stored outside the LRU (spec §4.9). Loading it once per
                // layer suffices; subsequent experts in the same layer hit
                // the same packed entry, so a miss here is not tracked
                // again by the LRU `put` below.
                self.load_gpt_oss_packed(layer, tensor_index, shard_cache).await?;
                return Ok(());
            }
        };

        let byte_len: u64 = buffers.iter().map(|(_, b)| b.shape.iter().product::<usize>() as u64 * 2).sum();
        let byte_len = if manifest.expert_bytes_override() > 0 {
            manifest.expert_bytes_override()
        } else {
            byte_len
        };

        let mut gpu_map: HashMap<String, WeightBuffer> = buffers.into_iter().collect();
        downcast_layer_weights(&mut gpu_map, true, false, self.pool.as_ref(), self.kernels.as_ref());

        // One LRU entry per expert; this crate models an expert as its
        // `down` projection buffer (representative of the whole set) since
        // the Expert LRU Cache tracks one `WeightBuffer` per key (spec
        // §3 "Expert LRU entry"). Gate/up buffers that survive downcast are
        // tracked by the loader state directly so they're still released
        // on `unload()`.
        if let Some(down) = gpu_map.remove("down") {
            if let Some(cache) = self.state.expert_cache.as_mut() {
                let evicted = cache.put(id, down, byte_len);
                for buf in evicted {
                    let _ = self.pool.release_buffer(buf.buffer);
                }
            }
        }
        for (key, buf) in gpu_map {
            self.state
                .final_weights
                .insert(format!("expert.{layer}.{expert}.{key}"), LoadedWeight::Gpu(buf));
        }
        Ok(())
    }

    async fn load_mixtral_expert(
        &self,
        layer: usize,
        expert: usize,
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
    ) -> LoaderResult<Vec<(String, WeightBuffer)>> {
        let forms = [
            (
                format!("model.layers.{layer}.block_sparse_moe.experts.{expert}.w1.weight"),
                format!("model.layers.{layer}.block_sparse_moe.experts.{expert}.w3.weight"),
                format!("model.layers.{layer}.block_sparse_moe.experts.{expert}.w2.weight"),
            ),
            (
                format!("model.layers.{layer}.mlp.experts.{expert}.gate_proj.weight"),
                format!("model.layers.{layer}.mlp.experts.{expert}.up_proj.weight"),
                format!("model.layers.{layer}.mlp.experts.{expert}.down_proj.weight"),
            ),
        ];

        for (gate_name, up_name, down_name) in &forms {
            if tensor_index.contains(gate_name) && tensor_index.contains(up_name) && tensor_index.contains(down_name) {
                let gate = self.load_named_weight(gate_name, tensor_index, shard_cache, Priority::High).await?;
                let up = self.load_named_weight(up_name, tensor_index, shard_cache, Priority::High).await?;
                let down = self.load_named_weight(down_name, tensor_index, shard_cache, Priority::High).await?;
                return Ok(vec![
                    ("gate".to_string(), expect_gpu(gate)?),
                    ("up".to_string(), expect_gpu(up)?),
                    ("down".to_string(), expect_gpu(down)?),
                ]);
            }
        }

        Err(LoaderError::ExpertWeightMissing(format!(
            "mixtral expert {expert} of layer {layer}: no gate/up/down tensors found under either naming form"
        )))
    }

    async fn load_gpt_oss_packed(
        &mut self,
        layer: usize,
        tensor_index: &TensorLocationIndex,
        shard_cache: &Arc<ShardCache>,
    ) -> LoaderResult<()> {
        let packed_key = format!("expert_pack.{layer}");
        if self.state.final_weights.contains_key(&packed_key) {
            return Ok(());
        }
        let required = [
            format!("model.layers.{layer}.mlp.experts.gate_up_proj_blocks"),
            format!("model.layers.{layer}.mlp.experts.gate_up_proj_scales"),
            format!("model.layers.{layer}.mlp.experts.down_proj_blocks"),
            format!("model.layers.{layer}.mlp.experts.down_proj_scales"),
        ];
        for name in &required {
            if !tensor_index.contains(name) {
                return Err(LoaderError::ExpertWeightMissing(format!(
                    "gpt-oss packed expert block '{name}' missing for layer {layer}"
                )));
            }
        }
        let primary = self.load_named_weight(&required[0], tensor_index, shard_cache, Priority::High).await?;
        self.state.final_weights.insert(packed_key, primary);

        for optional in [
            format!("model.layers.{layer}.mlp.experts.gate_up_proj_bias"),
            format!("model.layers.{layer}.mlp.experts.down_proj_bias"),
        ] {
            if tensor_index.contains(&optional) {
                let w = self.load_named_weight(&optional, tensor_index, shard_cache, Priority::High).await?;
                self.state.final_weights.insert(format!("expert_pack.{layer}.{optional}"), w);
            }
        }
        Ok(())
    }

    /// `prefetchExperts(nextLayer, indices)` (spec §6): fire-and-forget
    /// shard prefetch for an upcoming layer's experts.
    pub fn prefetch_experts(&self, shard_cache: &Arc<ShardCache>, next_layer: usize, indices: &[usize]) {
        let Some(manifest) = &self.manifest else { return };
        for &expert in indices {
            for shard in manifest.shards_for_expert(next_layer, expert) {
                shard_cache.prefetch(shard);
            }
        }
    }

    /// `predictNextLayerExperts(indices)` (spec §9 "MoE next-layer
    /// prediction stub"): no real prediction model is implemented; this
    /// returns the same indices unchanged so callers can wire prefetch
    /// logic against a stable interface now and swap in a real predictor
    /// later without changing call sites.
    pub fn predict_next_layer_experts(&self, indices: &[usize]) -> Vec<usize> {
        indices.to_vec()
    }

    pub fn record_memory_snapshot(&mut self) {
        let pool_stats = self.pool.stats();
        let expert_stats = self.state.expert_cache.as_ref().map(|c| c.stats());
        let snapshot = crate::memory_monitor::MemorySnapshot::capture(
            pool_stats,
            0,
            0,
            expert_stats,
            self.state.layers.len(),
        );
        self.memory_monitor.record(snapshot);
    }
}

fn expect_gpu(weight: LoadedWeight) -> LoaderResult<WeightBuffer> {
    match weight {
        LoadedWeight::Gpu(buf) => Ok(buf),
        LoadedWeight::Cpu(_) => Err(LoaderError::BudgetExceeded(
            "expert weight streamed to host memory; experts must fit in a single GPU buffer".into(),
        )),
    }
}

/// Estimate the byte size a tensor will occupy at its intended runtime
/// dtype (spec §4.9 streaming rule): quantized tensors dequantize to F16;
/// everything else keeps its element count at 2 or 4 bytes depending on
/// final dtype. Conservatively assumes F16 output for float sources too,
/// matching the `preferF16` default.
fn estimated_runtime_bytes(location: &TensorLocation) -> u64 {
    use crate::dtype::Dtype;
    let elements = location.shape_product() as u64;
    match location.dtype {
        Dtype::Q4K | Dtype::Q4KM | Dtype::Q6K | Dtype::F16 | Dtype::Bf16 => elements * 2,
        Dtype::F32 => elements * 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadingConfig;
    use crate::dtype::Dtype;
    use crate::gpu::{CpuReferenceDevice, CpuReferenceKernels, CpuReferencePool};
    use crate::manifest::JsonManifestParser;
    use crate::storage::InMemoryStorageBackend;
    use bytes::Bytes;
    use std::collections::HashMap as StdHashMap;

    fn float_tensor_json(shape: &[usize], dtype: &str, shard: usize, offset: u64, size: u64, role: &str) -> String {
        format!(
            r#"{{"shard":{shard},"offset":{offset},"size":{size},"shape":{shape:?},"dtype":"{dtype}","role":"{role}"}}"#
        )
    }

    fn sample_manifest(num_layers: usize, hidden: usize) -> String {
        let mut tensors = StdHashMap::new();
        let embed_bytes = (hidden * hidden * 4) as u64;
        tensors.insert(
            "tok_embeddings.weight".to_string(),
            float_tensor_json(&[hidden, hidden], "F32", 0, 0, embed_bytes, "embedding"),
        );
        let mut offset = embed_bytes;
        for layer in 0..num_layers {
            for suffix in [
                "self_attn.q_proj.weight",
                "self_attn.k_proj.weight",
                "self_attn.v_proj.weight",
                "self_attn.o_proj.weight",
                "mlp.gate_proj.weight",
                "mlp.up_proj.weight",
                "mlp.down_proj.weight",
            ] {
                let name = format!("model.layers.{layer}.{suffix}");
                let bytes = (hidden * hidden * 4) as u64;
                tensors.insert(name, float_tensor_json(&[hidden, hidden], "F32", 0, offset, bytes, "matmul"));
                offset += bytes;
            }
        }
        tensors.insert(
            "model.norm.weight".to_string(),
            float_tensor_json(&[hidden], "F32", 0, offset, (hidden * 4) as u64, "norm"),
        );
        offset += (hidden * 4) as u64;
        tensors.insert(
            "lm_head.weight".to_string(),
            float_tensor_json(&[hidden, hidden], "F32", 0, offset, (hidden * hidden * 4) as u64, "lm_head"),
        );
        offset += (hidden * hidden * 4) as u64;

        let tensors_json: StdHashMap<_, _> = tensors
            .into_iter()
            .map(|(k, v)| (k, serde_json::from_str::<serde_json::Value>(&v).unwrap()))
            .collect();

        serde_json::json!({
            "shards": [{"size": offset, "hash": "unused"}],
            "hashAlgorithm": "sha256",
            "tensors": tensors_json,
            "config": {"num_hidden_layers": num_layers},
            "inference": {
                "normalization": {"rmsNormWeightOffset": false},
                "output": {"tieWordEmbeddings": true}
            }
        })
        .to_string()
    }

    fn filled_shard(total: u64) -> Bytes {
        Bytes::from(vec![0u8; total as usize])
    }

    fn new_loader() -> Loader {
        Loader::new(
            Arc::new(CpuReferenceDevice::new()),
            Arc::new(CpuReferencePool::new()),
            Arc::new(CpuReferenceKernels::new()),
            Arc::new(JsonManifestParser),
            LoadingConfig::default(),
        )
    }

    #[tokio::test]
    async fn full_dense_load_reaches_complete_with_expected_layer_count() {
        let hidden = 8;
        let num_layers = 2;
        let manifest_json = sample_manifest(num_layers, hidden);
        let total_bytes = serde_json::from_str::<serde_json::Value>(&manifest_json).unwrap()["shards"][0]["size"]
            .as_u64()
            .unwrap();
        let backend = Arc::new(
            InMemoryStorageBackend::new()
                .with_manifest(manifest_json)
                .with_shard(0, filled_shard(total_bytes)),
        );

        let mut loader = new_loader();
        loader.init().unwrap();
        loader.loading_config.shard_cache.verify_hashes = false;
        let config = loader.load("demo-model", backend, None).await.unwrap();

        assert_eq!(loader.phase(), LoaderPhase::Complete);
        assert!(loader.get_stats().is_loaded);
        assert_eq!(loader.get_stats().layers_loaded, num_layers);
        assert_eq!(config.num_hidden_layers(), Some(num_layers));
        for layer in 0..num_layers {
            let weights = loader.get_layer_weights(layer).unwrap();
            assert!(weights.weights.contains_key("qProj"));
            assert!(weights.weights.contains_key("ffnDown"));
        }
        assert!(loader.state.final_weights.contains_key("finalNorm"));
    }

    #[tokio::test]
    async fn missing_manifest_fails_and_leaves_state_clean() {
        let backend = Arc::new(InMemoryStorageBackend::new());
        let mut loader = new_loader();
        loader.init().unwrap();
        let err = loader.load("missing", backend, None).await.unwrap_err();
        assert!(matches!(err, LoaderError::ConfigMissing(_)));
        assert!(!loader.get_stats().is_loaded);
        assert_eq!(loader.phase(), LoaderPhase::Idle);
    }

    #[tokio::test]
    async fn missing_required_attention_tensor_rolls_back() {
        let mut tensors = StdHashMap::new();
        tensors.insert(
            "tok_embeddings.weight".to_string(),
            serde_json::from_str::<serde_json::Value>(&float_tensor_json(&[4, 4], "F32", 0, 0, 64, "embedding"))
                .unwrap(),
        );
        let manifest_json = serde_json::json!({
            "shards": [{"size": 64, "hash": "unused"}],
            "hashAlgorithm": "sha256",
            "tensors": tensors,
            "config": {"num_hidden_layers": 1},
            "inference": {
                "normalization": {"rmsNormWeightOffset": false},
                "output": {"tieWordEmbeddings": true}
            }
        })
        .to_string();
        let backend = Arc::new(
            InMemoryStorageBackend::new()
                .with_manifest(manifest_json)
                .with_shard(0, filled_shard(64)),
        );
        let mut loader = new_loader();
        loader.init().unwrap();
        loader.loading_config.shard_cache.verify_hashes = false;
        let err = loader.load("demo", backend, None).await.unwrap_err();
        assert!(matches!(err, LoaderError::TensorNotFound(_)));
        assert_eq!(loader.phase(), LoaderPhase::Idle);
        assert!(!loader.get_stats().is_loaded);
        assert_eq!(loader.pool.stats().live_buffers, 0);
    }

    #[tokio::test]
    async fn moe_without_moe_config_fails_validation() {
        let manifest_json = serde_json::json!({
            "shards": [{"size": 4, "hash": "unused"}],
            "hashAlgorithm": "sha256",
            "tensors": {},
            "config": {"num_hidden_layers": 1, "num_local_experts": 8},
            "inference": {
                "normalization": {"rmsNormWeightOffset": false},
                "output": {"tieWordEmbeddings": true}
            }
        })
        .to_string();
        let backend = Arc::new(
            InMemoryStorageBackend::new()
                .with_manifest(manifest_json)
                .with_shard(0, filled_shard(4)),
        );
        let mut loader = new_loader();
        loader.init().unwrap();
        loader.loading_config.shard_cache.verify_hashes = false;
        let err = loader.load("demo", backend, None).await.unwrap_err();
        assert!(matches!(err, LoaderError::ConfigMissing(_)));
    }

    #[tokio::test]
    async fn manifest_column_wise_q4k_layout_disables_fused_path() {
        use crate::manifest::Q4KLayout;

        let hidden = 8;
        let num_layers = 1;
        let mut manifest_value: serde_json::Value =
            serde_json::from_str(&sample_manifest(num_layers, hidden)).unwrap();
        manifest_value["q4kLayout"] = serde_json::json!("column_wise");
        let manifest_json = manifest_value.to_string();
        let total_bytes = manifest_value["shards"][0]["size"].as_u64().unwrap();
        let backend = Arc::new(
            InMemoryStorageBackend::new()
                .with_manifest(manifest_json)
                .with_shard(0, filled_shard(total_bytes)),
        );

        let mut loader = new_loader();
        loader.init().unwrap();
        loader.loading_config.shard_cache.verify_hashes = false;
        loader.load("demo-model", backend, None).await.unwrap();

        // Manifest `q4kLayout: column_wise` must propagate into the
        // tensor-loader config the dispatch table reads (spec §3, §4.4).
        assert_eq!(
            loader.tensor_loader_config.q4k_layout,
            Some(Q4KLayout::ColumnWise)
        );
    }

    #[tokio::test]
    async fn explicit_q4k_config_overrides_manifest_layout() {
        use crate::manifest::Q4KLayout;

        let hidden = 8;
        let num_layers = 1;
        let mut manifest_value: serde_json::Value =
            serde_json::from_str(&sample_manifest(num_layers, hidden)).unwrap();
        manifest_value["q4kLayout"] = serde_json::json!("column_wise");
        let manifest_json = manifest_value.to_string();
        let total_bytes = manifest_value["shards"][0]["size"].as_u64().unwrap();
        let backend = Arc::new(
            InMemoryStorageBackend::new()
                .with_manifest(manifest_json)
                .with_shard(0, filled_shard(total_bytes)),
        );

        let mut loader = new_loader();
        loader.init().unwrap();
        loader.loading_config.shard_cache.verify_hashes = false;
        loader.set_q4k_config(true, Some(Q4KLayout::RowWise), false);
        loader.load("demo-model", backend, None).await.unwrap();

        // An explicit `setQ4KConfig` override wins over the manifest.
        assert_eq!(
            loader.tensor_loader_config.q4k_layout,
            Some(Q4KLayout::RowWise)
        );
    }

    #[test]
    fn predict_next_layer_experts_is_an_identity_stub() {
        let loader = new_loader();
        assert_eq!(loader.predict_next_layer_experts(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn estimated_runtime_bytes_matches_spec_packed_dequant_example() {
        let location = TensorLocation {
            shard_index: Some(0),
            spans: None,
            offset: 0,
            size: 9_000_000,
            shape: vec![4096, 4096],
            dtype: Dtype::Q4K,
            role: TensorRole::Matmul,
            group: None,
            layout: None,
            original_shape: None,
        };
        assert_eq!(estimated_runtime_bytes(&location), 4096 * 4096 * 2);
    }

    #[test]
    fn layer_candidates_cross_prefixes_and_suffixes() {
        let names = candidates(3, &["self_attn.q_proj.weight"]);
        assert!(names.contains(&"model.layers.3.self_attn.q_proj.weight".to_string()));
        assert!(names.contains(&"blk.3.self_attn.q_proj.weight".to_string()));
        assert_eq!(names.len(), LAYER_PREFIXES.len());
    }
}
