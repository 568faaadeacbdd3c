//! Error types for the graph executor.

use thiserror::Error;

use super::{LayerError, STATUS_CONFIG_ERROR};

/// Errors that can occur while building a net or extracting blobs from it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetError {
    #[error("Unknown layer type {layer_type} for layer {name}")]
    UnknownLayerType { layer_type: String, name: String },

    #[error("Blob {name} is produced by more than one layer")]
    DuplicateProducer { name: String },

    #[error("Blob {name} is consumed by layer {layer} before it is produced")]
    UndefinedBlob { name: String, layer: String },

    #[error("Blob {name} does not exist")]
    BlobNotFound { name: String },

    #[error("Blob index {index} must be within the {count} blobs of the net")]
    BlobIndexOutOfBounds { index: usize, count: usize },

    #[error("Blob {name} has no producer and was not provided as input")]
    MissingInput { name: String },

    #[error("Layer {layer} must declare at least one {what}")]
    EmptyLayerBlobs { layer: String, what: String },

    #[error("Failed to parse net definition: {message}")]
    InvalidDefinition { message: String },

    #[error("Layer {layer} failed: {source}")]
    LayerFailed {
        layer: String,
        #[source]
        source: LayerError,
    },

    #[error("Extractor is unusable after a failed extraction")]
    SessionPoisoned,
}

impl NetError {
    /// Integer status of this error. Layer failures keep the status of the layer.
    pub fn status_code(&self) -> i32 {
        match self {
            NetError::LayerFailed { source, .. } => source.status_code(),
            _ => STATUS_CONFIG_ERROR,
        }
    }

    pub(crate) fn layer(layer: &str, source: LayerError) -> Self {
        NetError::LayerFailed {
            layer: layer.to_string(),
            source,
        }
    }
}

impl From<NetError> for i32 {
    fn from(error: NetError) -> Self {
        error.status_code()
    }
}
