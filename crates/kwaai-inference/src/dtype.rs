//! Tensor dtype, role, and layout — tagged variants dispatched through
//! small match tables instead of the dtype-string / name-substring checks
//! a scripting-language loader would use.

use serde::{Deserialize, Serialize};

/// Block size (in elements) of a Q4_K / Q6_K superblock.
pub const QK_K: usize = 256;

/// Bytes occupied by one Q4_K superblock (one block of `QK_K` elements).
pub const Q4K_BLOCK_BYTES: usize = 144;

/// Bytes occupied by one Q6_K superblock (one block of `QK_K` elements).
pub const Q6K_BLOCK_BYTES: usize = 210;

/// On-disk tensor element type, as declared by the tensor map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Dtype {
    /// 4-bit k-quant, standard variant.
    #[serde(rename = "Q4_K")]
    Q4K,
    /// 4-bit k-quant, "M" (medium) variant; same block layout as `Q4K`.
    #[serde(rename = "Q4_K_M")]
    Q4KM,
    /// 6-bit k-quant.
    #[serde(rename = "Q6_K")]
    Q6K,
    /// bfloat16.
    Bf16,
    /// IEEE-754 half precision.
    F16,
    /// IEEE-754 single precision.
    F32,
}

impl Dtype {
    /// True for either Q4_K variant; the two share block layout and are
    /// handled identically by the dispatch table in `tensor_loader`.
    pub fn is_q4k(self) -> bool {
        matches!(self, Dtype::Q4K | Dtype::Q4KM)
    }

    /// Bytes per element for unquantized dtypes. Block-quantized dtypes
    /// have no fixed per-element stride; callers must not call this for
    /// `Q4K`/`Q4KM`/`Q6K`.
    pub fn byte_stride(self) -> Option<usize> {
        match self {
            Dtype::Bf16 | Dtype::F16 => Some(2),
            Dtype::F32 => Some(4),
            Dtype::Q4K | Dtype::Q4KM | Dtype::Q6K => None,
        }
    }
}

/// Runtime GPU dtype a [`crate::gpu::WeightBuffer`] is stored as. A subset
/// of [`Dtype`]: quantized weights either stay raw (`q4k`) or are
/// dequantized into one of the float variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuDtype {
    Q4k,
    F16,
    F32,
}

/// Row-major vs. column-major storage of a 2-D matmul weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Row,
    Column,
}

/// Semantic classification of a tensor, as declared by the manifest's
/// tensor map. Policy (dtype path, streaming, layout inference) is
/// derived from this, never from substring-matching the tensor name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    Embedding,
    Matmul,
    Norm,
    LmHead,
    Router,
    /// Anything the manifest doesn't need the loader to special-case
    /// (e.g. attention sinks, biases handled generically).
    #[serde(other)]
    Other,
}

impl TensorRole {
    pub fn is_matmul(&self) -> bool {
        matches!(self, TensorRole::Matmul)
    }

    pub fn is_embedding(&self) -> bool {
        matches!(self, TensorRole::Embedding)
    }
}

/// Sub-category of a tensor within its role, e.g. `group = "embed"` to
/// narrow an embedding-role search among several embedding-like tensors.
pub type TensorGroup = String;
