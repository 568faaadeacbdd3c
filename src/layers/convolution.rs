//! Dense 2-D convolution: the grouped convolution with a single group.

use crate::config::RuntimeConfig;
use crate::errors::LayerResult;
use crate::layers::{ConvolutionDepthWise, Layer, LayerFlags};
use crate::mat::Mat;
use crate::model_bin::ModelBin;
use crate::param_dict::ParamDict;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Convolution::default())
}

#[derive(Debug, Clone, Default)]
pub struct Convolution {
    inner: ConvolutionDepthWise,
}

impl Convolution {
    pub fn as_grouped(&self) -> &ConvolutionDepthWise {
        &self.inner
    }
}

impl Layer for Convolution {
    fn type_name(&self) -> &'static str {
        "Convolution"
    }

    fn flags(&self) -> LayerFlags {
        self.inner.flags()
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        let mut pd = pd.clone();
        pd.set_int(7, 1);
        self.inner.load_param(&pd)
    }

    fn load_model(&mut self, mb: &mut dyn ModelBin) -> LayerResult<()> {
        self.inner.load_model(mb)
    }

    fn create_pipeline(&mut self, opt: &RuntimeConfig) -> LayerResult<()> {
        self.inner.create_pipeline(opt)
    }

    fn destroy_pipeline(&mut self, opt: &RuntimeConfig) -> LayerResult<()> {
        self.inner.destroy_pipeline(opt)
    }

    fn forward(&self, bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
        self.inner.forward(bottom, opt)
    }

    fn int8_input_scale(&self) -> Option<f32> {
        self.inner.int8_input_scale()
    }

    fn enable_int8_requantize(&mut self, top_scale: f32) -> LayerResult<()> {
        self.inner.enable_int8_requantize(top_scale)
    }
}
