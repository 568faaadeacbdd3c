//! On-device neural network inference runtime.
//!
//! A [`Net`] holds a static graph of layers loaded from a [`NetDefinition`]
//! and a weight source. Each request opens an [`Extractor`], binds its input
//! blobs and asks for output blobs; only the layers on the path to a
//! requested blob run. Tensors ([`Mat`]) draw their storage from pooled
//! allocators passed through [`RuntimeConfig`], so repeated inferences reuse
//! buffers instead of returning to the system allocator.
//!
//! Convolutions support groups, dilation, SAME padding, fused activations and
//! an int8 path that quantizes inputs, accumulates in 32-bit integers and
//! either dequantizes to floats or requantizes for a following int8 layer.

pub mod activation;
pub mod allocator;
pub mod config;
pub mod errors;
pub mod extractor;
pub mod gpu;
pub mod kernels;
pub mod layers;
pub mod mat;
pub mod model_bin;
pub mod net;
pub mod net_definition;
pub mod parallel;
pub mod param_dict;

pub use activation::Activation;
pub use allocator::{Allocator, PoolAllocator, UnlockedPoolAllocator};
pub use config::RuntimeConfig;
pub use errors::{LayerError, LayerResult, ModelBinError, NetError, NetResult};
pub use extractor::Extractor;
pub use layers::{Layer, LayerFlags};
pub use mat::Mat;
pub use model_bin::{ModelBin, ModelBinFromBytes, ModelBinFromMatArray};
pub use net::Net;
pub use net_definition::{LayerDefinition, NetDefinition};
pub use param_dict::{ParamDict, ParamValue};
