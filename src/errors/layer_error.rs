//! Error types for layer operations.

use thiserror::Error;

use super::{ModelBinError, STATUS_ALLOCATION_FAILURE, STATUS_CONFIG_ERROR};

/// Errors that can occur while loading, preparing or running a layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("Failed to allocate {bytes} bytes")]
    AllocationFailure { bytes: usize },

    #[error("Invalid group configuration: {channels} channels and {num_output} outputs are not divisible by group {group}")]
    InvalidGroup {
        channels: usize,
        num_output: usize,
        group: usize,
    },

    #[error("Quantized int8 weights loaded but int8 inference is disabled")]
    Int8WeightsWithoutInt8Inference,

    #[error("Requantize requested but int8 requantize is disabled")]
    RequantizeDisabled,

    #[error("Shape mismatch on {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Layer does not implement {operation}")]
    UnsupportedForward { operation: String },

    #[error("Missing weights: {reason}")]
    MissingWeights { reason: String },

    #[error("Invalid parameter {key}: {reason}")]
    InvalidParam { key: usize, reason: String },

    #[error("Unsupported cast from type {from} to type {to}")]
    UnsupportedCast { from: i32, to: i32 },

    #[error("Unsupported element size {elemsize} for {operation}")]
    UnsupportedElemSize { elemsize: usize, operation: String },
}

impl LayerError {
    /// Integer status of this error: `-100` for allocation failures, `-1` otherwise.
    pub fn status_code(&self) -> i32 {
        match self {
            LayerError::AllocationFailure { .. } => STATUS_ALLOCATION_FAILURE,
            _ => STATUS_CONFIG_ERROR,
        }
    }

    pub(crate) fn unsupported(operation: &str) -> Self {
        LayerError::UnsupportedForward {
            operation: operation.to_string(),
        }
    }

    pub(crate) fn shape(what: &str, expected: usize, actual: usize) -> Self {
        LayerError::ShapeMismatch {
            what: what.to_string(),
            expected,
            actual,
        }
    }
}

impl From<LayerError> for i32 {
    fn from(error: LayerError) -> Self {
        error.status_code()
    }
}

impl From<ModelBinError> for LayerError {
    fn from(error: ModelBinError) -> Self {
        match error {
            ModelBinError::Allocation { bytes } => LayerError::AllocationFailure { bytes },
            other => LayerError::MissingWeights {
                reason: other.to_string(),
            },
        }
    }
}
