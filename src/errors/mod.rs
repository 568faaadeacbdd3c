//! Error types for the inference runtime.
//!
//! Layers report failures through [`LayerError`], the graph executor through
//! [`NetError`] and weight sources through [`ModelBinError`]. Every error maps
//! onto the integer status taxonomy used at the outer boundary: `0` for
//! success, `-100` when a buffer could not be obtained and `-1` for a violated
//! precondition.

mod layer_error;
mod model_bin_error;
mod net_error;

pub use layer_error::LayerError;
pub use model_bin_error::ModelBinError;
pub use net_error::NetError;

/// Status of a successful operation.
pub const STATUS_OK: i32 = 0;

/// Status of an operation that could not obtain a buffer from its allocator.
pub const STATUS_ALLOCATION_FAILURE: i32 = -100;

/// Status of an operation whose preconditions were violated.
pub const STATUS_CONFIG_ERROR: i32 = -1;

/// Result type alias for layer operations.
pub type LayerResult<T> = std::result::Result<T, LayerError>;

/// Result type alias for graph executor operations.
pub type NetResult<T> = std::result::Result<T, NetError>;

/// Result type alias for weight source reads.
pub type ModelBinResult<T> = std::result::Result<T, ModelBinError>;

/// Converts a result into its integer status code.
pub fn status_of<T, E: Into<i32>>(result: std::result::Result<T, E>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => e.into(),
    }
}
