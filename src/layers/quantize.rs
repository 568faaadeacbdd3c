//! Float to int8 quantization.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::kernels::quantize_slice;
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::param_dict::ParamDict;
use crate::parallel::parallel_chunks_mut;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Quantize::default())
}

/// Computes `int8 = round(clamp(x * scale, -127, 127))`.
///
/// A zero scale maps every input to 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantize {
    scale: f32,
}

impl Quantize {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Single-threaded kernel over raw slices, for use inside a caller's
    /// parallel loop.
    pub fn quantize_into(&self, src: &[f32], dst: &mut [i8]) {
        quantize_slice(src, dst, self.scale);
    }
}

impl Default for Quantize {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Layer for Quantize {
    fn type_name(&self) -> &'static str {
        "Quantize"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: true,
            ..LayerFlags::default()
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        self.scale = pd.get_float(0, 1.0);
        Ok(())
    }

    fn forward(&self, bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
        if bottom.elemsize() != 4 || bottom.elempack() != 1 {
            return Err(LayerError::UnsupportedElemSize {
                elemsize: bottom.elemsize(),
                operation: "quantize".to_string(),
            });
        }

        let mut top = Mat::create_like(bottom, 1, opt.blob_allocator())?;
        let chunk = if bottom.dims() == 3 {
            bottom.cstep()
        } else {
            bottom.total()
        };
        let src = bottom.as_slice::<f32>();
        parallel_chunks_mut(opt.num_threads, top.as_mut_slice::<i8>()?, chunk, |q, dst| {
            self.quantize_into(&src[q * chunk..q * chunk + dst.len()], dst);
        });
        Ok(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_per_channel() {
        let bottom = Mat::from_slice_3d(2, 1, 2, &[0.04f32, -0.26, 1.0, -2.0]).unwrap();
        let top = Quantize::new(10.0)
            .forward(&bottom, &RuntimeConfig::new().with_threads(2))
            .unwrap();
        assert_eq!(top.elemsize(), 1);
        assert_eq!(top.c(), 2);
        assert_eq!(top.as_slice::<i8>(), &[0, -3, 10, -20]);
    }

    #[test]
    fn test_zero_scale_yields_zero() {
        let bottom = Mat::from_slice_1d(&[1.0f32, -5.0, 300.0]).unwrap();
        let top = Quantize::new(0.0).forward(&bottom, &RuntimeConfig::new()).unwrap();
        assert_eq!(top.as_slice::<i8>(), &[0, 0, 0]);
    }

    #[test]
    fn test_load_param_scale() {
        let mut layer = Quantize::default();
        layer.load_param(&ParamDict::new().with_float(0, 64.0)).unwrap();
        assert_eq!(layer.scale(), 64.0);
    }

    #[test]
    fn test_rejects_int8_input() {
        let bottom = Mat::from_slice_1d(&[1i8, 2]).unwrap();
        let result = Quantize::new(1.0).forward(&bottom, &RuntimeConfig::new());
        assert!(matches!(result, Err(LayerError::UnsupportedElemSize { elemsize: 1, .. })));
    }
}
