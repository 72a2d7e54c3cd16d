//! Tensor Loader (spec §4.4): dtype-aware conversion from raw tensor
//! bytes to GPU-resident (or, for the CPU path, host-resident) weights.
//! Dispatch is a small match table keyed on `(Dtype, TensorRole,
//! capabilities)`, never a name-substring check (spec §9).

use candle_core::Tensor;
use half::{bf16, f16};

use crate::dtype::{Dtype, GpuDtype, Layout, Q4K_BLOCK_BYTES, Q6K_BLOCK_BYTES, QK_K};
use crate::error::{LoaderError, LoaderResult};
use crate::gpu::{bytes_to_f32_tensor, wrap_bytes, GpuBufferPool, GpuCapabilities, GpuKernels, WeightBuffer};
use crate::manifest::{Q4KLayout, TensorLocation};

/// Per-`load()` dispatch knobs (spec §4.4 `config`).
#[derive(Debug, Clone, Copy)]
pub struct TensorLoaderConfig {
    pub use_fused_q4k: bool,
    pub keep_f32_weights: bool,
    pub q4k_layout: Option<Q4KLayout>,
    pub gpu_capabilities: GpuCapabilities,
    pub allow_f32_upcast_non_matmul: bool,
}

impl Default for TensorLoaderConfig {
    fn default() -> Self {
        Self {
            use_fused_q4k: true,
            keep_f32_weights: false,
            q4k_layout: None,
            gpu_capabilities: GpuCapabilities::default(),
            allow_f32_upcast_non_matmul: false,
        }
    }
}

/// Result of the host (`toGPU=false`) path, used by the LoRA adapter
/// loader (external collaborator, spec §4.4).
pub enum CpuTensor {
    /// Q4_K/Q6_K pass through unconverted.
    Raw(Vec<u8>),
    Float(Tensor),
}

/// "Packed" Q4K detection (spec §4.4): a 2-D Q4K weight whose stored byte
/// count is less than the row-wise expected count forces the dequant
/// path because the fused kernel cannot consume it.
pub fn is_packed_q4k(location: &TensorLocation) -> bool {
    if location.shape.len() != 2 {
        return false;
    }
    let rows = location.shape[0];
    let cols = location.shape[1];
    let expected_rowwise = rows * cols.div_ceil(QK_K) * Q4K_BLOCK_BYTES;
    (location.size as usize) < expected_rowwise
}

/// Layout resolution (spec §4.4): explicit `layout` always wins; 2-D
/// embeddings with `dim0 < dim1` infer column layout; otherwise row.
pub fn resolve_layout(location: &TensorLocation) -> Layout {
    if let Some(layout) = location.layout {
        return layout;
    }
    if location.role.is_embedding() && location.shape.len() == 2 && location.shape[0] < location.shape[1] {
        return Layout::Column;
    }
    Layout::Row
}

fn fused_q4k_eligible(location: &TensorLocation, config: &TensorLoaderConfig) -> bool {
    config.use_fused_q4k
        && config.gpu_capabilities.has_subgroups
        && location.role.is_matmul()
        && !location.role.is_embedding()
        && !is_packed_q4k(location)
        && config.q4k_layout != Some(Q4KLayout::ColumnWise)
}

/// GPU path dispatch (spec §4.4 table). Given a tensor's raw bytes and
/// location, produces a GPU-resident [`WeightBuffer`].
pub fn load_tensor_gpu(
    bytes: &[u8],
    location: &TensorLocation,
    name: &str,
    config: &TensorLoaderConfig,
    pool: &dyn GpuBufferPool,
    kernels: &dyn GpuKernels,
) -> LoaderResult<WeightBuffer> {
    let layout = resolve_layout(location);
    match location.dtype {
        Dtype::Q4K | Dtype::Q4KM => load_q4k(bytes, location, name, config, layout, pool, kernels),
        Dtype::Q6K => load_q6k(bytes, location, name, layout, config, pool, kernels),
        Dtype::Bf16 => load_bf16(bytes, location, name, layout, config, pool, kernels),
        Dtype::F16 => load_f16(bytes, location, name, layout, config, pool, kernels),
        Dtype::F32 => load_f32(bytes, location, name, layout, pool),
    }
}

fn load_q4k(
    bytes: &[u8],
    location: &TensorLocation,
    name: &str,
    config: &TensorLoaderConfig,
    layout: Layout,
    pool: &dyn GpuBufferPool,
    kernels: &dyn GpuKernels,
) -> LoaderResult<WeightBuffer> {
    if fused_q4k_eligible(location, config) {
        let buffer = wrap_bytes(pool, bytes, name)?;
        return Ok(WeightBuffer {
            buffer,
            dtype: GpuDtype::Q4k,
            layout: Layout::Row,
            shape: location.shape.clone(),
            label: name.to_string(),
        });
    }

    let output_dtype = if config.gpu_capabilities.has_f16 {
        GpuDtype::F16
    } else {
        GpuDtype::F32
    };

    let row_wise = location.shape.len() == 2 && location.shape[1] % QK_K != 0;
    let output = if row_wise {
        let rows = location.shape[0];
        let cols = location.shape[1];
        kernels.dequantize_rowwise(pool, bytes, rows, cols, output_dtype)?
    } else {
        let num_blocks = bytes.len() / Q4K_BLOCK_BYTES;
        kernels.dequantize(pool, bytes, num_blocks, output_dtype)?
    };

    Ok(WeightBuffer {
        buffer: output.buffer,
        dtype: output_dtype,
        layout,
        shape: location.shape.clone(),
        label: name.to_string(),
    })
}

fn load_q6k(
    bytes: &[u8],
    location: &TensorLocation,
    name: &str,
    layout: Layout,
    config: &TensorLoaderConfig,
    pool: &dyn GpuBufferPool,
    kernels: &dyn GpuKernels,
) -> LoaderResult<WeightBuffer> {
    // Q6_K always dequantizes to F16 (spec §4.4); `config` is read only to
    // stay consistent with the other dispatch arms' signature.
    let _ = config;
    let num_blocks = bytes.len() / Q6K_BLOCK_BYTES;
    let output = kernels.dequantize_q6k(pool, bytes, num_blocks, GpuDtype::F16)?;
    Ok(WeightBuffer {
        buffer: output.buffer,
        dtype: GpuDtype::F16,
        layout,
        shape: location.shape.clone(),
        label: name.to_string(),
    })
}

fn load_bf16(
    bytes: &[u8],
    location: &TensorLocation,
    name: &str,
    layout: Layout,
    config: &TensorLoaderConfig,
    pool: &dyn GpuBufferPool,
    kernels: &dyn GpuKernels,
) -> LoaderResult<WeightBuffer> {
    if location.role.is_matmul() && config.gpu_capabilities.has_f16 {
        let output = kernels.run_bf16_to_f16(pool, bytes, &location.shape, name)?;
        return Ok(WeightBuffer {
            buffer: output.buffer,
            dtype: GpuDtype::F16,
            layout,
            shape: location.shape.clone(),
            label: name.to_string(),
        });
    }
    let output = kernels.run_bf16_to_f32(pool, bytes, &location.shape, name)?;
    Ok(WeightBuffer {
        buffer: output.buffer,
        dtype: GpuDtype::F32,
        layout,
        shape: location.shape.clone(),
        label: name.to_string(),
    })
}

fn load_f16(
    bytes: &[u8],
    location: &TensorLocation,
    name: &str,
    layout: Layout,
    config: &TensorLoaderConfig,
    pool: &dyn GpuBufferPool,
    kernels: &dyn GpuKernels,
) -> LoaderResult<WeightBuffer> {
    if location.role.is_matmul() {
        let buffer = wrap_bytes(pool, bytes, name)?;
        return Ok(WeightBuffer {
            buffer,
            dtype: GpuDtype::F16,
            layout,
            shape: location.shape.clone(),
            label: name.to_string(),
        });
    }
    if config.allow_f32_upcast_non_matmul {
        let raw = wrap_bytes(pool, bytes, name)?;
        let output = kernels.cast_f16_to_f32(pool, raw)?;
        pool.release_buffer(raw)?;
        return Ok(WeightBuffer {
            buffer: output.buffer,
            dtype: GpuDtype::F32,
            layout,
            shape: location.shape.clone(),
            label: name.to_string(),
        });
    }
    let buffer = wrap_bytes(pool, bytes, name)?;
    Ok(WeightBuffer {
        buffer,
        dtype: GpuDtype::F16,
        layout,
        shape: location.shape.clone(),
        label: name.to_string(),
    })
}

fn load_f32(
    bytes: &[u8],
    location: &TensorLocation,
    name: &str,
    layout: Layout,
    pool: &dyn GpuBufferPool,
) -> LoaderResult<WeightBuffer> {
    let buffer = wrap_bytes(pool, bytes, name)?;
    Ok(WeightBuffer {
        buffer,
        dtype: GpuDtype::F32,
        layout,
        shape: location.shape.clone(),
        label: name.to_string(),
    })
}

/// CPU path (`toGPU=false`, spec §4.4): Q4K/Q6K pass through as raw
/// quantized bytes; BF16/F16 convert to F32 on the host; F32 is returned
/// as-is.
pub fn load_tensor_cpu(bytes: &[u8], location: &TensorLocation) -> LoaderResult<CpuTensor> {
    match location.dtype {
        Dtype::Q4K | Dtype::Q4KM | Dtype::Q6K => Ok(CpuTensor::Raw(bytes.to_vec())),
        Dtype::Bf16 => {
            let values: Vec<f32> = bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect();
            Ok(CpuTensor::Float(float_tensor(&values, &location.shape)?))
        }
        Dtype::F16 => {
            let values: Vec<f32> = bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect();
            Ok(CpuTensor::Float(float_tensor(&values, &location.shape)?))
        }
        Dtype::F32 => {
            let tensor = bytes_to_f32_tensor(bytes, &location.shape, candle_core::DType::F32)?;
            Ok(CpuTensor::Float(tensor))
        }
    }
}

fn float_tensor(values: &[f32], shape: &[usize]) -> LoaderResult<Tensor> {
    Tensor::from_slice(values, shape, &candle_core::Device::Cpu).map_err(LoaderError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::TensorRole;
    use crate::gpu::{CpuReferenceKernels, CpuReferencePool};

    fn location(dtype: Dtype, role: TensorRole, shape: Vec<usize>, size: u64) -> TensorLocation {
        TensorLocation {
            shard_index: Some(0),
            spans: None,
            offset: 0,
            size,
            shape,
            dtype,
            role,
            group: None,
            layout: None,
            original_shape: None,
        }
    }

    #[test]
    fn packed_q4k_detection_matches_spec_example() {
        let exact = location(Dtype::Q4K, TensorRole::Matmul, vec![4096, 4096], 9_437_184);
        assert!(!is_packed_q4k(&exact));
        let packed = location(Dtype::Q4K, TensorRole::Matmul, vec![4096, 4096], 9_000_000);
        assert!(is_packed_q4k(&packed));
    }

    #[test]
    fn fused_path_selected_only_under_full_conditions() {
        let loc = location(Dtype::Q4K, TensorRole::Matmul, vec![4096, 4096], 9_437_184);
        let mut config = TensorLoaderConfig {
            use_fused_q4k: true,
            gpu_capabilities: GpuCapabilities {
                has_f16: true,
                has_subgroups: true,
            },
            ..Default::default()
        };
        assert!(fused_q4k_eligible(&loc, &config));

        config.q4k_layout = Some(Q4KLayout::ColumnWise);
        assert!(!fused_q4k_eligible(&loc, &config));
    }

    #[test]
    fn embedding_with_dim0_less_than_dim1_infers_column_layout() {
        let loc = location(Dtype::F32, TensorRole::Embedding, vec![100, 4096], 100 * 4096 * 4);
        assert_eq!(resolve_layout(&loc), Layout::Column);
    }

    #[test]
    fn explicit_layout_wins_over_inference() {
        let mut loc = location(Dtype::F32, TensorRole::Embedding, vec![100, 4096], 100 * 4096 * 4);
        loc.layout = Some(Layout::Row);
        assert_eq!(resolve_layout(&loc), Layout::Row);
    }

    #[test]
    fn f32_matmul_wraps_without_conversion() {
        let pool = CpuReferencePool::new();
        let kernels = CpuReferenceKernels::new();
        let loc = location(Dtype::F32, TensorRole::Matmul, vec![2], 8);
        let bytes = [1.0f32, 2.0f32].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
        let config = TensorLoaderConfig::default();
        let result = load_tensor_gpu(&bytes, &loc, "w", &config, &pool, &kernels).unwrap();
        assert_eq!(result.dtype, GpuDtype::F32);
        assert_eq!(pool.read(result.buffer).unwrap(), bytes);
    }

    #[test]
    fn q6k_always_dequantizes_to_f16() {
        let pool = CpuReferencePool::new();
        let kernels = CpuReferenceKernels::new();
        let bytes = vec![0u8; Q6K_BLOCK_BYTES];
        let loc = location(Dtype::Q6K, TensorRole::Matmul, vec![256], Q6K_BLOCK_BYTES as u64);
        let config = TensorLoaderConfig::default();
        let result = load_tensor_gpu(&bytes, &loc, "w", &config, &pool, &kernels).unwrap();
        assert_eq!(result.dtype, GpuDtype::F16);
    }

    #[test]
    fn cpu_path_passes_q4k_through_raw() {
        let bytes = vec![7u8; Q4K_BLOCK_BYTES];
        let loc = location(Dtype::Q4K, TensorRole::Matmul, vec![256], Q4K_BLOCK_BYTES as u64);
        match load_tensor_cpu(&bytes, &loc).unwrap() {
            CpuTensor::Raw(raw) => assert_eq!(raw, bytes),
            CpuTensor::Float(_) => panic!("expected raw passthrough for Q4K"),
        }
    }
}
