//! Manifest and tensor-map types (spec §3 Data Model), plus the
//! `ManifestParser`/`TensorMapParser` external-collaborator traits and a
//! `serde_json`-backed reference implementation (spec §6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dtype::{Dtype, Layout, TensorRole};
use crate::error::{LoaderError, LoaderResult};

/// Per-shard descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    pub size: u64,
    pub hash: String,
    #[serde(default)]
    pub hash_algorithm: Option<String>,
}

/// One span of a multi-shard tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(alias = "shard")]
    pub shard_index: usize,
    pub offset: u64,
    pub size: u64,
}

/// Where a tensor's bytes physically live, plus the metadata the loader
/// dispatches on (spec §3 "Tensor Location").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorLocation {
    #[serde(default, alias = "shard")]
    pub shard_index: Option<usize>,
    #[serde(default)]
    pub spans: Option<Vec<Span>>,
    pub offset: u64,
    pub size: u64,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub role: TensorRole,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub layout: Option<Layout>,
    #[serde(default)]
    pub original_shape: Option<Vec<usize>>,
}

impl TensorLocation {
    /// Product of `shape`'s dimensions — the element count to use for any
    /// readback/transform, never the (possibly padded) allocated buffer
    /// size (spec §4.6, §9).
    pub fn shape_product(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_multi_span(&self) -> bool {
        self.spans.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Mixture-of-experts declaration. Presence with `num_experts > 1` marks
/// the model MoE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpertFormat {
    Mixtral,
    GptOss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoeConfig {
    pub num_experts: usize,
    pub num_experts_per_token: usize,
    pub expert_format: ExpertFormat,
}

/// `q4kLayout` manifest field: `column_wise` disables the fused Q4K path
/// and pre-transposes matmul weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Q4KLayout {
    Flat,
    RowWise,
    ColumnWise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NormalizationConfig {
    pub rms_norm_weight_offset: Option<bool>,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            rms_norm_weight_offset: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutputConfig {
    pub tie_word_embeddings: Option<bool>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            tie_word_embeddings: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub normalization: NormalizationConfig,
    pub output: OutputConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            normalization: NormalizationConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

/// Architectural parameters the orchestrator consults. Kept as a loose
/// JSON map plus a couple of named fields with fallbacks, since the exact
/// key set varies by model family (e.g. `num_hidden_layers` vs.
/// `n_layers` vs. `num_local_experts`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArchConfig {
    #[serde(flatten)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelArchConfig {
    fn default() -> Self {
        Self {
            raw: serde_json::Map::new(),
        }
    }
}

impl ModelArchConfig {
    /// `num_hidden_layers` with the named fallbacks the spec requires.
    pub fn num_hidden_layers(&self) -> Option<usize> {
        for key in ["num_hidden_layers", "n_layers", "num_layers"] {
            if let Some(v) = self.raw.get(key).and_then(|v| v.as_u64()) {
                return Some(v as usize);
            }
        }
        None
    }

    pub fn num_local_experts(&self) -> Option<usize> {
        self.raw
            .get("num_local_experts")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}

/// The root descriptor (spec §3 "Manifest").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub shards: Vec<ShardInfo>,
    pub hash_algorithm: String,
    #[serde(default)]
    pub tensors_file: Option<String>,
    #[serde(default)]
    pub tensors: Option<HashMap<String, TensorLocation>>,
    pub config: ModelArchConfig,
    #[serde(default)]
    pub moe_config: Option<MoeConfig>,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub q4k_layout: Option<Q4KLayout>,
    /// Byte budget per expert, overriding the summed buffer size when
    /// present (spec §4.9 LoadExpert, mixtral format).
    #[serde(default)]
    pub expert_bytes: Option<u64>,
    /// `"{layer}:{expert}" -> [shardIndex]`; absent/empty entries mean
    /// unmapped (load the expert's shards on demand). Keyed by a composite
    /// string rather than a tuple because JSON object keys must be
    /// strings; see [`Manifest::shards_for_expert`] for the typed lookup.
    #[serde(default)]
    pub expert_shard_map: HashMap<String, Vec<usize>>,
    /// `"{layer}:{expert}" -> [tensorName]`.
    #[serde(default)]
    pub expert_tensor_map: HashMap<String, Vec<String>>,
}

impl Manifest {
    fn expert_key(layer: usize, expert: usize) -> String {
        format!("{layer}:{expert}")
    }

    /// `getShardsForExpert` (spec §6): empty ⇒ unmapped, load on demand.
    pub fn shards_for_expert(&self, layer: usize, expert: usize) -> Vec<usize> {
        self.expert_shard_map
            .get(&Self::expert_key(layer, expert))
            .cloned()
            .unwrap_or_default()
    }

    /// `getTensorsForExpert` (spec §6).
    pub fn tensors_for_expert(&self, layer: usize, expert: usize) -> Vec<String> {
        self.expert_tensor_map
            .get(&Self::expert_key(layer, expert))
            .cloned()
            .unwrap_or_default()
    }

    /// `getExpertBytes` (spec §6): `0` ⇒ unmapped, caller falls back to
    /// summing buffer sizes.
    pub fn expert_bytes_override(&self) -> u64 {
        self.expert_bytes.unwrap_or(0)
    }

    /// Is this manifest for a Mixture-of-Experts model?
    pub fn is_moe(&self) -> bool {
        self.moe_config
            .as_ref()
            .is_some_and(|m| m.num_experts > 1)
    }

    pub fn rms_norm_weight_offset(&self) -> LoaderResult<bool> {
        self.inference
            .normalization
            .rms_norm_weight_offset
            .ok_or_else(|| {
                LoaderError::ConfigMissing(
                    "inference.normalization.rmsNormWeightOffset is required".into(),
                )
            })
    }

    pub fn tie_word_embeddings(&self) -> LoaderResult<bool> {
        self.inference.output.tie_word_embeddings.ok_or_else(|| {
            LoaderError::ConfigMissing("inference.output.tieWordEmbeddings is required".into())
        })
    }

    /// Validate the fields the core reads are present and consistent;
    /// called during the `ParseManifest` phase.
    pub fn validate(&self) -> LoaderResult<()> {
        self.rms_norm_weight_offset()?;
        self.tie_word_embeddings()?;
        if let Some(n) = self.config.num_local_experts() {
            if n > 1 && self.moe_config.is_none() {
                return Err(LoaderError::ConfigMissing(
                    "config.num_local_experts > 1 but moeConfig is absent; model needs \
                     re-conversion"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

/// External collaborator: parses a manifest/tensor-map JSON payload.
/// Implementations in production read these from the archive's local
/// store or a network fetch; the loader itself never does I/O here.
pub trait ManifestParser: Send + Sync {
    fn parse_manifest(&self, json: &str) -> LoaderResult<Manifest>;
    fn parse_tensor_map(&self, json: &str) -> LoaderResult<HashMap<String, TensorLocation>>;
}

/// Reference `ManifestParser` backed by `serde_json`, the same library
/// this crate's pre-existing `loader.rs` already uses for `config.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonManifestParser;

impl ManifestParser for JsonManifestParser {
    fn parse_manifest(&self, json: &str) -> LoaderResult<Manifest> {
        let mut manifest: Manifest = serde_json::from_str(json)
            .map_err(|e| LoaderError::ConfigMissing(format!("invalid manifest JSON: {e}")))?;
        // Legacy `shard` field normalization happens in `Span`/`TensorLocation`
        // via serde aliases; nothing further to normalize here.
        if let Some(tensors) = manifest.tensors.as_mut() {
            for loc in tensors.values_mut() {
                normalize_location(loc);
            }
        }
        Ok(manifest)
    }

    fn parse_tensor_map(&self, json: &str) -> LoaderResult<HashMap<String, TensorLocation>> {
        let mut map: HashMap<String, TensorLocation> = serde_json::from_str(json)
            .map_err(|e| LoaderError::ConfigMissing(format!("invalid tensor map JSON: {e}")))?;
        for loc in map.values_mut() {
            normalize_location(loc);
        }
        Ok(map)
    }
}

fn normalize_location(_loc: &mut TensorLocation) {
    // `shard_index` and `span.shard_index` already absorb the legacy
    // `shard` key via `#[serde(alias = "shard")]`; kept as an explicit
    // hook so future legacy fields have one place to land.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest_json() -> &'static str {
        r#"{
            "shards": [{"size": 1000, "hash": "abc"}, {"size": 500, "hash": "def"}],
            "hashAlgorithm": "sha256",
            "tensors": {
                "T": {
                    "spans": [
                        {"shard": 0, "offset": 900, "size": 100},
                        {"shard": 1, "offset": 0, "size": 50}
                    ],
                    "offset": 0,
                    "size": 150,
                    "shape": [150],
                    "dtype": "F32",
                    "role": "other"
                }
            },
            "config": {"num_hidden_layers": 2},
            "inference": {
                "normalization": {"rmsNormWeightOffset": false},
                "output": {"tieWordEmbeddings": true}
            }
        }"#
    }

    #[test]
    fn parses_legacy_shard_field_on_spans() {
        let parser = JsonManifestParser;
        let manifest = parser.parse_manifest(sample_manifest_json()).unwrap();
        let t = &manifest.tensors.unwrap()["T"];
        let spans = t.spans.as_ref().unwrap();
        assert_eq!(spans[0].shard_index, 0);
        assert_eq!(spans[1].shard_index, 1);
        assert_eq!(t.shape_product(), 150);
    }

    #[test]
    fn validate_requires_inference_flags() {
        let json = r#"{
            "shards": [],
            "hashAlgorithm": "sha256",
            "config": {},
            "inference": {"normalization": {}, "output": {}}
        }"#;
        let manifest = JsonManifestParser.parse_manifest(json).unwrap();
        assert!(matches!(
            manifest.validate(),
            Err(LoaderError::ConfigMissing(_))
        ));
    }

    #[test]
    fn moe_without_config_is_config_missing() {
        let json = r#"{
            "shards": [],
            "hashAlgorithm": "sha256",
            "config": {"num_local_experts": 8},
            "inference": {
                "normalization": {"rmsNormWeightOffset": true},
                "output": {"tieWordEmbeddings": false}
            }
        }"#;
        let manifest = JsonManifestParser.parse_manifest(json).unwrap();
        assert!(manifest.validate().is_err());
    }
}
