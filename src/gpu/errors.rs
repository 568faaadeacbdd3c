//! GPU-specific error types.

use thiserror::Error;

/// Errors raised while preparing a layer for GPU execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuModelError {
    #[error("Model too large for GPU: {model_size} f32s exceeds limit of {max_size} f32s")]
    ModelTooLarge { model_size: usize, max_size: usize },

    #[error("Dispatch of {invocations} invocations exceeds GPU limit of {max_invocations}")]
    DispatchTooLarge {
        invocations: usize,
        max_invocations: usize,
    },

    #[error("Layer cannot run on the GPU: {reason}")]
    UnsupportedLayer { reason: String },

    #[error("Invalid input shape {w}x{h}x{c}: {reason}")]
    InvalidInputShape {
        w: usize,
        h: usize,
        c: usize,
        reason: String,
    },
}

pub type GpuModelResult<T> = std::result::Result<T, GpuModelError>;
