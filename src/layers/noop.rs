//! Pass-through layer.

use crate::config::RuntimeConfig;
use crate::errors::LayerResult;
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Noop)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl Layer for Noop {
    fn type_name(&self) -> &'static str {
        "Noop"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: false,
            support_inplace: true,
            support_gpu: true,
            support_packing: true,
            support_fp16_storage: true,
        }
    }

    fn forward_inplace_multi(&self, _blobs: &mut [Mat], _opt: &RuntimeConfig) -> LayerResult<()> {
        Ok(())
    }
}
