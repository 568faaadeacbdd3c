//! Graph entry point.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::param_dict::ParamDict;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Input::default())
}

/// Declares a blob the caller must provide. The declared shape is
/// informational; zero means unspecified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Input {
    w: usize,
    h: usize,
    c: usize,
}

impl Input {
    /// Declared `(w, h, c)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.w, self.h, self.c)
    }
}

fn dim(pd: &ParamDict, key: usize) -> LayerResult<usize> {
    usize::try_from(pd.get_int(key, 0)).map_err(|_| LayerError::InvalidParam {
        key,
        reason: "input dimensions must not be negative".to_string(),
    })
}

impl Layer for Input {
    fn type_name(&self) -> &'static str {
        "Input"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: true,
            support_inplace: true,
            support_gpu: true,
            support_packing: true,
            support_fp16_storage: true,
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        self.w = dim(pd, 0)?;
        self.h = dim(pd, 1)?;
        self.c = dim(pd, 2)?;
        Ok(())
    }

    fn forward_inplace(&self, _blob: &mut Mat, _opt: &RuntimeConfig) -> LayerResult<()> {
        Ok(())
    }
}
