//! Inference-time batch normalization.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::kernels::scale_bias_in_place;
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::model_bin::{ModelBin, TYPE_RAW_F32};
use crate::param_dict::ParamDict;
use crate::parallel::parallel_chunks_mut;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(BatchNorm::default())
}

/// Applies `x * b + a` per channel, with `a` and `b` folded from the trained
/// slope, mean, variance and bias when the weights are loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchNorm {
    channels: usize,
    eps: f32,
    a_data: Vec<f32>,
    b_data: Vec<f32>,
}

impl BatchNorm {
    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl Layer for BatchNorm {
    fn type_name(&self) -> &'static str {
        "BatchNorm"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: true,
            support_inplace: true,
            support_packing: true,
            ..LayerFlags::default()
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        self.channels = usize::try_from(pd.get_int(0, 0)).map_err(|_| LayerError::InvalidParam {
            key: 0,
            reason: "channels must not be negative".to_string(),
        })?;
        self.eps = pd.get_float(1, 0.0);
        Ok(())
    }

    fn load_model(&mut self, mb: &mut dyn ModelBin) -> LayerResult<()> {
        let slope = mb.load_1d(self.channels, TYPE_RAW_F32)?;
        let mean = mb.load_1d(self.channels, TYPE_RAW_F32)?;
        let var = mb.load_1d(self.channels, TYPE_RAW_F32)?;
        let bias = mb.load_1d(self.channels, TYPE_RAW_F32)?;

        let (slope, mean, var, bias) = (
            slope.as_slice::<f32>(),
            mean.as_slice::<f32>(),
            var.as_slice::<f32>(),
            bias.as_slice::<f32>(),
        );

        self.a_data.clear();
        self.b_data.clear();
        for i in 0..self.channels {
            let sqrt_var = (var[i] + self.eps).sqrt();
            self.a_data.push(bias[i] - slope[i] * mean[i] / sqrt_var);
            self.b_data.push(slope[i] / sqrt_var);
        }
        Ok(())
    }

    fn forward_inplace(&self, blob: &mut Mat, opt: &RuntimeConfig) -> LayerResult<()> {
        if blob.scalar_size() != 4 {
            return Err(LayerError::UnsupportedElemSize {
                elemsize: blob.elemsize(),
                operation: "batchnorm".to_string(),
            });
        }

        let elempack = blob.elempack();
        let (groups, group_len) = match blob.dims() {
            1 => (blob.w(), 1),
            2 => (blob.h(), blob.w()),
            _ => (blob.c(), blob.cstep()),
        };
        if groups * elempack != self.channels {
            return Err(LayerError::shape("batchnorm channels", self.channels, groups * elempack));
        }

        parallel_chunks_mut(
            opt.num_threads,
            blob.as_mut_slice::<f32>()?,
            group_len * elempack,
            |q, values| {
                if elempack == 1 {
                    scale_bias_in_place(values, self.b_data[q], self.a_data[q]);
                    return;
                }
                for lanes in values.chunks_exact_mut(elempack) {
                    for (lane, v) in lanes.iter_mut().enumerate() {
                        let channel = q * elempack + lane;
                        *v = *v * self.b_data[channel] + self.a_data[channel];
                    }
                }
            },
        );
        Ok(())
    }
}
