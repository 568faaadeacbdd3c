//! GPU compute backend for float grouped convolution.
//!
//! A convolution layer is packed into a single contiguous f32 array that a
//! WGSL compute shader reads as one storage buffer. Work is enqueued on a
//! command buffer; results are valid only after the caller submits and waits
//! on the queue before mapping the output buffer.
//!
//! # Memory Layout
//!
//! - Header ([`HEADER_SIZE_F32S`] f32s, integers stored as bitcast u32)
//! - Weights (`maxk * channels / group * num_output` f32s)
//! - Bias (`num_output` f32s, present when the layer has a bias term)
//!
//! # Usage
//!
//! ```ignore
//! use blobnet_inference::gpu::{GpuConvolution, get_convolution_wgsl};
//!
//! let gpu_conv = GpuConvolution::from_layer(&conv, 32, 32)?;
//! let wgsl_source = get_convolution_wgsl(64);
//! // bind gpu_conv.as_bytes() at binding 0, the input at 1, the output at 2
//! // and dispatch gpu_conv.workgroup_count(64) workgroups
//! ```

pub mod errors;
pub mod gpu_convolution;
pub mod shaders;

pub use errors::{GpuModelError, GpuModelResult};
pub use gpu_convolution::{GpuConvolution, HEADER_SIZE_F32S};
pub use shaders::get_convolution_wgsl;
