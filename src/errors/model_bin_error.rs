//! Error types for sequential weight sources.

use thiserror::Error;

/// Errors raised while reading weights from a [`crate::model_bin::ModelBin`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelBinError {
    #[error("Weight data truncated: requested {requested} bytes, {remaining} remaining")]
    Truncated { requested: usize, remaining: usize },

    #[error("Unknown weight storage flag {flag:#010x}")]
    UnknownFlag { flag: u32 },

    #[error("Unsupported weight type {type_tag}")]
    UnsupportedType { type_tag: i32 },

    #[error("Weight source exhausted after {consumed} reads")]
    Exhausted { consumed: usize },

    #[error("Weight size mismatch: requested {requested} elements, source holds {actual}")]
    SizeMismatch { requested: usize, actual: usize },

    #[error("Failed to allocate {bytes} bytes for weights")]
    Allocation { bytes: usize },
}
