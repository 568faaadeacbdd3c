//! Fan-out of one blob to several consumers.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Split)
}

/// Every top is a view of the single bottom; no data is copied.
#[derive(Debug, Clone, Copy, Default)]
pub struct Split;

impl Layer for Split {
    fn type_name(&self) -> &'static str {
        "Split"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: false,
            support_inplace: false,
            support_gpu: true,
            support_packing: true,
            support_fp16_storage: true,
        }
    }

    fn forward_multi(
        &self,
        bottoms: &[Mat],
        tops: &mut [Mat],
        _opt: &RuntimeConfig,
    ) -> LayerResult<()> {
        let [bottom] = bottoms else {
            return Err(LayerError::shape("split bottoms", 1, bottoms.len()));
        };
        for top in tops.iter_mut() {
            *top = bottom.clone();
        }
        Ok(())
    }
}
