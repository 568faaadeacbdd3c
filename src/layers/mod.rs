//! Layer contract and the static registry of layer types.
//!
//! A layer is created from its type name, configured once through
//! [`Layer::load_param`] and [`Layer::load_model`], prepared with
//! [`Layer::create_pipeline`] and then run any number of times. The executor
//! picks the forward variant from the layer's [`LayerFlags`]: out-of-place
//! [`Layer::forward`] or in-place [`Layer::forward_inplace`], each with a
//! multi-blob form for layers that are not single input, single output.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::mat::Mat;
use crate::model_bin::ModelBin;
use crate::param_dict::ParamDict;

pub mod batchnorm;
pub mod cast;
pub mod convolution;
pub mod convolution_depthwise;
pub mod crop;
pub mod dequantize;
pub mod input;
pub mod noop;
pub mod quantize;
pub mod relu;
pub mod requantize;
pub mod split;

pub use batchnorm::BatchNorm;
pub use cast::Cast;
pub use convolution::Convolution;
pub use convolution_depthwise::{ConvolutionDepthWise, Padding};
pub use crop::Crop;
pub use dequantize::Dequantize;
pub use input::Input;
pub use noop::Noop;
pub use quantize::Quantize;
pub use relu::ReLU;
pub use requantize::Requantize;
pub use split::Split;

/// Capabilities a layer declares at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerFlags {
    /// Exactly one bottom and one top; the single-blob forward variants apply.
    pub one_blob_only: bool,
    /// Outputs overwrite inputs; the in-place forward variants apply.
    pub support_inplace: bool,
    /// A GPU kernel exists for this layer.
    pub support_gpu: bool,
    /// Accepts channel-interleaved inputs (elempack > 1).
    pub support_packing: bool,
    /// Accepts half precision inputs without a cast back to f32.
    pub support_fp16_storage: bool,
}

/// Base trait for all layer types.
pub trait Layer: Send + Sync {
    /// Registered type name.
    fn type_name(&self) -> &'static str;

    fn flags(&self) -> LayerFlags;

    /// Reads typed configuration from the layer's parameter dictionary.
    fn load_param(&mut self, _pd: &ParamDict) -> LayerResult<()> {
        Ok(())
    }

    /// Reads weight tensors, in declaration order.
    fn load_model(&mut self, _mb: &mut dyn ModelBin) -> LayerResult<()> {
        Ok(())
    }

    /// Derives internal state that every forward call reuses.
    fn create_pipeline(&mut self, _opt: &RuntimeConfig) -> LayerResult<()> {
        Ok(())
    }

    /// Releases what [`Layer::create_pipeline`] built.
    fn destroy_pipeline(&mut self, _opt: &RuntimeConfig) -> LayerResult<()> {
        Ok(())
    }

    /// Out-of-place single-blob forward.
    fn forward(&self, _bottom: &Mat, _opt: &RuntimeConfig) -> LayerResult<Mat> {
        Err(LayerError::unsupported("forward"))
    }

    /// Out-of-place forward over several blobs. `tops` arrives sized to the
    /// layer's declared outputs and is only written when the call succeeds.
    fn forward_multi(
        &self,
        bottoms: &[Mat],
        tops: &mut [Mat],
        opt: &RuntimeConfig,
    ) -> LayerResult<()> {
        if !self.flags().one_blob_only {
            return Err(LayerError::unsupported("forward_multi"));
        }
        let (Some(bottom), Some(top)) = (bottoms.first(), tops.first_mut()) else {
            return Err(LayerError::shape("layer blobs", 1, 0));
        };
        *top = self.forward(bottom, opt)?;
        Ok(())
    }

    /// In-place single-blob forward.
    fn forward_inplace(&self, _blob: &mut Mat, _opt: &RuntimeConfig) -> LayerResult<()> {
        Err(LayerError::unsupported("forward_inplace"))
    }

    /// In-place forward over several blobs.
    fn forward_inplace_multi(&self, blobs: &mut [Mat], opt: &RuntimeConfig) -> LayerResult<()> {
        if !self.flags().one_blob_only {
            return Err(LayerError::unsupported("forward_inplace_multi"));
        }
        let Some(blob) = blobs.first_mut() else {
            return Err(LayerError::shape("layer blobs", 1, 0));
        };
        self.forward_inplace(blob, opt)
    }

    /// Scale this layer quantizes its input with, when it accepts int8 input
    /// directly in place of a float blob.
    fn int8_input_scale(&self) -> Option<f32> {
        None
    }

    /// Switches the layer to produce int8 output at `top_scale`.
    fn enable_int8_requantize(&mut self, _top_scale: f32) -> LayerResult<()> {
        Err(LayerError::RequantizeDisabled)
    }
}

/// Constructor stored in the registry.
pub type LayerCreator = fn() -> Box<dyn Layer>;

/// One registry row.
#[derive(Debug, Clone, Copy)]
pub struct LayerRegistryEntry {
    pub name: &'static str,
    pub creator: LayerCreator,
}

/// Every layer type known to the runtime, indexed by position.
pub static LAYER_REGISTRY: &[LayerRegistryEntry] = &[
    LayerRegistryEntry {
        name: "Input",
        creator: input::create,
    },
    LayerRegistryEntry {
        name: "Convolution",
        creator: convolution::create,
    },
    LayerRegistryEntry {
        name: "ConvolutionDepthWise",
        creator: convolution_depthwise::create,
    },
    LayerRegistryEntry {
        name: "Quantize",
        creator: quantize::create,
    },
    LayerRegistryEntry {
        name: "Dequantize",
        creator: dequantize::create,
    },
    LayerRegistryEntry {
        name: "Requantize",
        creator: requantize::create,
    },
    LayerRegistryEntry {
        name: "ReLU",
        creator: relu::create,
    },
    LayerRegistryEntry {
        name: "BatchNorm",
        creator: batchnorm::create,
    },
    LayerRegistryEntry {
        name: "Split",
        creator: split::create,
    },
    LayerRegistryEntry {
        name: "Noop",
        creator: noop::create,
    },
    LayerRegistryEntry {
        name: "Crop",
        creator: crop::create,
    },
    LayerRegistryEntry {
        name: "Cast",
        creator: cast::create,
    },
];

/// Registry index of a layer type.
pub fn layer_to_index(type_name: &str) -> Option<usize> {
    LAYER_REGISTRY
        .iter()
        .position(|entry| entry.name == type_name)
}

/// Creates a layer of the named type.
pub fn create_layer(type_name: &str) -> Option<Box<dyn Layer>> {
    layer_to_index(type_name).and_then(create_layer_by_index)
}

/// Creates a layer from its registry index.
pub fn create_layer_by_index(index: usize) -> Option<Box<dyn Layer>> {
    LAYER_REGISTRY.get(index).map(|entry| (entry.creator)())
}
