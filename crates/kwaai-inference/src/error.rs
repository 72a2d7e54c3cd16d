//! Error types for the inference engine

use thiserror::Error;

/// Result type for inference operations
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Errors that can occur during inference
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Model loading failed
    #[error("Failed to load model: {0}")]
    ModelLoadError(String),

    /// Model not found
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Invalid model format
    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    /// Inference failed
    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    /// Tensor operation failed
    #[error("Tensor operation failed: {0}")]
    TensorError(String),

    /// Out of memory
    #[error("Out of memory: required {required} bytes, available {available} bytes")]
    OutOfMemory { required: usize, available: usize },

    /// Device not available
    #[error("Device not available: {0}")]
    DeviceNotAvailable(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Model handle invalid
    #[error("Invalid model handle: {0}")]
    InvalidHandle(u64),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<candle_core::Error> for InferenceError {
    fn from(err: candle_core::Error) -> Self {
        InferenceError::TensorError(err.to_string())
    }
}

/// Result type for weight-loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Error taxonomy for the weight-loading pipeline (shard cache, tensor
/// index/reader/loader, expert cache, orchestrator). Kept separate from
/// [`InferenceError`] because the loader's failure modes are much more
/// specific than "model load failed" — callers branch on these variants
/// (e.g. to decide whether a missing optional norm is recoverable).
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Manifest absent, a required inference field missing, or a MoE
    /// model declared without `moeConfig`/`expertFormat`.
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    /// A shard is missing or its digest doesn't match the manifest.
    #[error("integrity check failed: {0}")]
    IntegrityError(String),

    /// A read's `offset + size` exceeds the shard's declared/actual size.
    #[error("shard {shard} too small: need {needed} bytes, have {have}")]
    ShardTooSmall {
        shard: usize,
        needed: usize,
        have: usize,
    },

    /// A required tensor (e.g. embeddings, LM head) could not be located.
    #[error("tensor not found: {0}")]
    TensorNotFound(String),

    /// GPU device unavailable, or a selected path needs a feature the
    /// device doesn't report.
    #[error("capability error: {0}")]
    CapabilityError(String),

    /// A weight exceeds the device's buffer-binding limit and its source
    /// dtype cannot be streamed via a CPU Weight Buffer.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// A tensor required by the declared MoE `expertFormat` is absent.
    #[error("expert weight missing: {0}")]
    ExpertWeightMissing(String),

    /// Storage backend or network failure, passed through unchanged.
    #[error("backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

impl From<candle_core::Error> for LoaderError {
    fn from(err: candle_core::Error) -> Self {
        LoaderError::BackendError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(err: std::io::Error) -> Self {
        LoaderError::BackendError(anyhow::Error::new(err))
    }
}
