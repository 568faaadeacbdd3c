//! Int32 accumulator to int8 conversion at a new scale.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::kernels::requantize_slice;
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::model_bin::{ModelBin, TYPE_RAW_F32};
use crate::param_dict::ParamDict;
use crate::parallel::parallel_chunks_mut;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Requantize::default())
}

/// Computes `int8 = narrow(relu?(acc * scale_in + bias) * scale_out)`.
///
/// `scale_in` undoes the input and weight quantization of the accumulator and
/// follows the same zero rule as dequantization; `scale_out` quantizes for
/// the next int8 consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Requantize {
    scale_in: f32,
    scale_out: f32,
    bias_term: bool,
    bias_data_size: usize,
    fusion_relu: bool,
    bias_data: Vec<f32>,
}

impl Requantize {
    /// Creates a requantize op; an empty `bias` disables the bias term.
    pub fn new(scale_in: f32, scale_out: f32, bias: Vec<f32>, fusion_relu: bool) -> Self {
        Self {
            scale_in,
            scale_out,
            bias_term: !bias.is_empty(),
            bias_data_size: bias.len(),
            fusion_relu,
            bias_data: bias,
        }
    }

    pub fn scale_in(&self) -> f32 {
        self.scale_in
    }

    pub fn scale_out(&self) -> f32 {
        self.scale_out
    }

    pub fn fusion_relu(&self) -> bool {
        self.fusion_relu
    }

    fn bias_for(&self, index: usize) -> f32 {
        match self.bias_data.as_slice() {
            [] => 0.0,
            [shared] => *shared,
            bias => bias.get(index).copied().unwrap_or(0.0),
        }
    }

    /// Single-threaded kernel over one channel of accumulators.
    pub fn requantize_channel(&self, src: &[i32], dst: &mut [i8], channel: usize) {
        requantize_slice(
            src,
            dst,
            self.scale_in,
            self.bias_for(channel),
            self.scale_out,
            self.fusion_relu,
        );
    }
}

impl Default for Requantize {
    fn default() -> Self {
        Self::new(1.0, 1.0, Vec::new(), false)
    }
}

impl Layer for Requantize {
    fn type_name(&self) -> &'static str {
        "Requantize"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: true,
            ..LayerFlags::default()
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        self.scale_in = pd.get_float(0, 1.0);
        self.scale_out = pd.get_float(1, 1.0);
        self.bias_term = pd.get_int(2, 0) != 0;
        self.bias_data_size = usize::try_from(pd.get_int(3, 0)).map_err(|_| {
            LayerError::InvalidParam {
                key: 3,
                reason: "bias_data_size must not be negative".to_string(),
            }
        })?;
        self.fusion_relu = pd.get_int(4, 0) != 0;
        Ok(())
    }

    fn load_model(&mut self, mb: &mut dyn ModelBin) -> LayerResult<()> {
        if self.bias_term {
            let bias = mb.load_1d(self.bias_data_size, TYPE_RAW_F32)?;
            self.bias_data = bias.as_slice::<f32>().to_vec();
        }
        Ok(())
    }

    fn forward(&self, bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
        if bottom.elemsize() != 4 || bottom.elempack() != 1 {
            return Err(LayerError::UnsupportedElemSize {
                elemsize: bottom.elemsize(),
                operation: "requantize".to_string(),
            });
        }

        let mut top = Mat::create_like(bottom, 1, opt.blob_allocator())?;
        let chunk = match bottom.dims() {
            1 if self.bias_data.len() > 1 => 1,
            1 => bottom.total(),
            2 => bottom.w(),
            _ => bottom.cstep(),
        };
        let src = bottom.as_slice::<i32>();
        parallel_chunks_mut(opt.num_threads, top.as_mut_slice::<i8>()?, chunk, |q, dst| {
            self.requantize_channel(&src[q * chunk..q * chunk + dst.len()], dst, q);
        });
        Ok(top)
    }
}
