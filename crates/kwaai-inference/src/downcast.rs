//! Weight Downcast (spec §4.5): after a layer's matmul weights have been
//! materialized as F32 `WeightBuffer`s, opportunistically cast them down
//! to F16 on a device that supports it, freeing the wider buffer.
//! Per-weight failure is logged and non-fatal — the loader keeps the F32
//! buffer rather than aborting the whole layer.

use crate::dtype::GpuDtype;
use crate::gpu::{GpuBufferPool, GpuKernels, WeightBuffer};

/// The fixed set of per-layer matmul weight keys eligible for downcast
/// (spec §4.5). Any name outside this set is left untouched.
pub const DOWNCAST_KEYS: &[&str] = &[
    "qProj",
    "kProj",
    "vProj",
    "oProj",
    "ffnGate",
    "ffnUp",
    "ffnDown",
    "ffnGateUp",
    "routerWeight",
];

/// Cast every F32 matmul weight in `weights` whose key is in
/// [`DOWNCAST_KEYS`] down to F16, in place. No-op when `has_f16` is false
/// or `keep_f32_weights` is set.
pub fn downcast_layer_weights(
    weights: &mut std::collections::HashMap<String, WeightBuffer>,
    has_f16: bool,
    keep_f32_weights: bool,
    pool: &dyn GpuBufferPool,
    kernels: &dyn GpuKernels,
) {
    if !has_f16 || keep_f32_weights {
        return;
    }
    for key in DOWNCAST_KEYS {
        let Some(buffer) = weights.get(*key) else {
            continue;
        };
        if buffer.dtype != GpuDtype::F32 {
            continue;
        }
        match kernels.cast_f32_to_f16(pool, buffer.buffer) {
            Ok(output) => {
                let old = buffer.buffer;
                let entry = weights.get_mut(*key).expect("checked above");
                entry.buffer = output.buffer;
                entry.dtype = GpuDtype::F16;
                if let Err(err) = pool.release_buffer(old) {
                    tracing::warn!(key = %key, error = %err, "failed to release downcast source buffer");
                }
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "weight downcast failed, keeping F32 buffer");
            }
        }
    }
}
