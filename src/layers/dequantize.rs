//! Int32 accumulator to float conversion.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::kernels::dequantize_in_place;
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::model_bin::{ModelBin, TYPE_RAW_F32};
use crate::param_dict::ParamDict;
use crate::parallel::parallel_chunks_mut;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Dequantize::default())
}

/// Computes `float = acc * scale + bias`, in place over a 4-byte blob.
///
/// The bias is either a single value shared by every channel or one value per
/// channel (per row for 2-D blobs, per element for 1-D blobs).
#[derive(Debug, Clone, PartialEq)]
pub struct Dequantize {
    scale: f32,
    bias_term: bool,
    bias_data_size: usize,
    bias_data: Vec<f32>,
}

impl Dequantize {
    /// Creates a dequantize op; an empty `bias` disables the bias term.
    pub fn new(scale: f32, bias: Vec<f32>) -> Self {
        Self {
            scale,
            bias_term: !bias.is_empty(),
            bias_data_size: bias.len(),
            bias_data: bias,
        }
    }

    /// Rescale factor for an accumulator of int8 inputs and int8 weights.
    ///
    /// Zero when either scale is zero.
    pub fn rescale(input_scale: f32, weight_scale: f32) -> f32 {
        if input_scale == 0.0 || weight_scale == 0.0 {
            0.0
        } else {
            1.0 / (input_scale * weight_scale)
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    fn bias_for(&self, index: usize) -> f32 {
        match self.bias_data.as_slice() {
            [] => 0.0,
            [shared] => *shared,
            bias => bias.get(index).copied().unwrap_or(0.0),
        }
    }

    /// Single-threaded kernel: dequantizes one channel of accumulators in place,
    /// leaving the result as f32 bit patterns.
    pub fn dequantize_channel_in_place(&self, values: &mut [i32], channel: usize) {
        dequantize_in_place(values, self.scale, self.bias_for(channel));
    }
}

impl Default for Dequantize {
    fn default() -> Self {
        Self::new(1.0, Vec::new())
    }
}

impl Layer for Dequantize {
    fn type_name(&self) -> &'static str {
        "Dequantize"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: true,
            support_inplace: true,
            ..LayerFlags::default()
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        self.scale = pd.get_float(0, 1.0);
        self.bias_term = pd.get_int(1, 0) != 0;
        self.bias_data_size = usize::try_from(pd.get_int(2, 0)).map_err(|_| {
            LayerError::InvalidParam {
                key: 2,
                reason: "bias_data_size must not be negative".to_string(),
            }
        })?;
        Ok(())
    }

    fn load_model(&mut self, mb: &mut dyn ModelBin) -> LayerResult<()> {
        if self.bias_term {
            let bias = mb.load_1d(self.bias_data_size, TYPE_RAW_F32)?;
            self.bias_data = bias.as_slice::<f32>().to_vec();
        }
        Ok(())
    }

    fn forward_inplace(&self, blob: &mut Mat, opt: &RuntimeConfig) -> LayerResult<()> {
        if blob.elemsize() != 4 || blob.elempack() != 1 {
            return Err(LayerError::UnsupportedElemSize {
                elemsize: blob.elemsize(),
                operation: "dequantize".to_string(),
            });
        }

        let chunk = match blob.dims() {
            1 if self.bias_data.len() > 1 => 1,
            1 => blob.total(),
            2 => blob.w(),
            _ => blob.cstep(),
        };
        parallel_chunks_mut(opt.num_threads, blob.as_mut_slice::<i32>()?, chunk, |q, values| {
            self.dequantize_channel_in_place(values, q);
        });
        Ok(())
    }
}
