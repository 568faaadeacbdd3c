//! Rectified linear unit with optional negative slope.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::kernels::{relu_in_place, relu_in_place_i8};
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::param_dict::ParamDict;
use crate::parallel::parallel_chunks_mut;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(ReLU::default())
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReLU {
    slope: f32,
}

impl ReLU {
    pub fn new(slope: f32) -> Self {
        Self { slope }
    }
}

impl Layer for ReLU {
    fn type_name(&self) -> &'static str {
        "ReLU"
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
        self.slope = pd.get_float(0, 0.0);
        Ok(())
    }

    fn forward_inplace(&self, blob: &mut Mat, opt: &RuntimeConfig) -> LayerResult<()> {
        let chunk = (blob.cstep() * blob.elempack()).max(1);
        match blob.scalar_size() {
            4 => parallel_chunks_mut(opt.num_threads, blob.as_mut_slice::<f32>()?, chunk, |_, values| {
                relu_in_place(values, self.slope)
            }),
            1 => parallel_chunks_mut(opt.num_threads, blob.as_mut_slice::<i8>()?, chunk, |_, values| {
                relu_in_place_i8(values, self.slope)
            }),
            _ => {
                return Err(LayerError::UnsupportedElemSize {
                    elemsize: blob.elemsize(),
                    operation: "relu".to_string(),
                });
            }
        }
        Ok(())
    }
}
