//! Runtime configuration threaded through every layer call.

use std::sync::Arc;
use std::thread;

use crate::allocator::Allocator;

/// Allocators, thread count and feature toggles for one net or session.
///
/// Cloning is cheap: allocators are shared handles. Nothing here is global;
/// two nets can run side by side with different configurations.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Release intermediate blobs as soon as their last consumer has run.
    pub lightmode: bool,
    /// Worker threads available to a single layer's forward call.
    pub num_threads: usize,
    /// Allocator for blobs that outlive a layer call. `None` uses the system.
    pub blob_allocator: Option<Arc<dyn Allocator>>,
    /// Allocator for scratch buffers that die inside a layer call.
    pub workspace_allocator: Option<Arc<dyn Allocator>>,
    pub use_packing_layout: bool,
    pub use_fp16_storage: bool,
    pub use_fp16_arithmetic: bool,
    pub use_int8_inference: bool,
    pub use_winograd_convolution: bool,
    pub use_sgemm_convolution: bool,
    pub use_gpu_compute: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            lightmode: true,
            num_threads: default_threads(),
            blob_allocator: None,
            workspace_allocator: None,
            use_packing_layout: false,
            use_fp16_storage: false,
            use_fp16_arithmetic: false,
            use_int8_inference: true,
            use_winograd_convolution: true,
            use_sgemm_convolution: true,
            use_gpu_compute: false,
        }
    }

    pub fn with_lightmode(mut self, enabled: bool) -> Self {
        self.lightmode = enabled;
        self
    }

    /// Sets the worker count. A count of zero is treated as one.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = threads.max(1);
        self
    }

    pub fn with_blob_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.blob_allocator = Some(allocator);
        self
    }

    pub fn with_workspace_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.workspace_allocator = Some(allocator);
        self
    }

    pub fn with_packing_layout(mut self, enabled: bool) -> Self {
        self.use_packing_layout = enabled;
        self
    }

    pub fn with_fp16_storage(mut self, enabled: bool) -> Self {
        self.use_fp16_storage = enabled;
        self
    }

    pub fn with_fp16_arithmetic(mut self, enabled: bool) -> Self {
        self.use_fp16_arithmetic = enabled;
        self
    }

    pub fn with_int8_inference(mut self, enabled: bool) -> Self {
        self.use_int8_inference = enabled;
        self
    }

    pub fn with_winograd_convolution(mut self, enabled: bool) -> Self {
        self.use_winograd_convolution = enabled;
        self
    }

    pub fn with_sgemm_convolution(mut self, enabled: bool) -> Self {
        self.use_sgemm_convolution = enabled;
        self
    }

    pub fn with_gpu_compute(mut self, enabled: bool) -> Self {
        self.use_gpu_compute = enabled;
        self
    }

    /// Copy for a layer invoked from inside another layer's parallel loop.
    pub fn for_nested(&self) -> Self {
        let mut nested = self.clone();
        nested.num_threads = 1;
        nested
    }

    pub(crate) fn blob_allocator(&self) -> Option<&Arc<dyn Allocator>> {
        self.blob_allocator.as_ref()
    }

    pub(crate) fn workspace_allocator(&self) -> Option<&Arc<dyn Allocator>> {
        self.workspace_allocator.as_ref()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
