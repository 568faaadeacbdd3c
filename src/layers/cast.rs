//! Element type conversion between f32 and f16 storage.

use half::f16;

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::param_dict::ParamDict;
use crate::parallel::parallel_chunks_mut;

pub const CAST_FLOAT32: i32 = 1;
pub const CAST_FLOAT16: i32 = 2;
pub const CAST_INT8: i32 = 3;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Cast::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cast {
    type_from: i32,
    type_to: i32,
}

impl Cast {
    pub fn new(type_from: i32, type_to: i32) -> Self {
        Self { type_from, type_to }
    }
}

impl Default for Cast {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Converts packed f32 data to f16 storage of the same shape and packing.
pub fn cast_float32_to_float16(bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
    let mut top = Mat::create_like(bottom, 2 * bottom.elempack(), opt.blob_allocator())?;
    let src = bottom.as_slice::<f32>();
    let chunk = (bottom.cstep() * bottom.elempack()).max(1);
    parallel_chunks_mut(opt.num_threads, top.as_mut_slice::<f16>()?, chunk, |q, dst| {
        for (d, s) in dst.iter_mut().zip(&src[q * chunk..]) {
            *d = f16::from_f32(*s);
        }
    });
    Ok(top)
}

/// Converts packed f16 storage back to f32.
pub fn cast_float16_to_float32(bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
    let mut top = Mat::create_like(bottom, 4 * bottom.elempack(), opt.blob_allocator())?;
    let src = bottom.as_slice::<f16>();
    let chunk = (bottom.cstep() * bottom.elempack()).max(1);
    parallel_chunks_mut(opt.num_threads, top.as_mut_slice::<f32>()?, chunk, |q, dst| {
        for (d, s) in dst.iter_mut().zip(&src[q * chunk..]) {
            *d = s.to_f32();
        }
    });
    Ok(top)
}

impl Layer for Cast {
    fn type_name(&self) -> &'static str {
        "Cast"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: true,
            support_packing: true,
            support_fp16_storage: true,
            ..LayerFlags::default()
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        self.type_from = pd.get_int(0, 0);
        self.type_to = pd.get_int(1, 0);
        Ok(())
    }

    fn forward(&self, bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
        if self.type_from == self.type_to {
            return Ok(bottom.clone());
        }

        let expected_scalar = match self.type_from {
            CAST_FLOAT32 => 4,
            CAST_FLOAT16 => 2,
            _ => 0,
        };
        if bottom.scalar_size() != expected_scalar {
            return Err(LayerError::UnsupportedElemSize {
                elemsize: bottom.elemsize(),
                operation: format!("cast from type {}", self.type_from),
            });
        }

        match (self.type_from, self.type_to) {
            (CAST_FLOAT32, CAST_FLOAT16) => cast_float32_to_float16(bottom, opt),
            (CAST_FLOAT16, CAST_FLOAT32) => cast_float16_to_float32(bottom, opt),
            (from, to) => Err(LayerError::UnsupportedCast { from, to }),
        }
    }
}
