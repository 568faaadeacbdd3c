//! Per-request evaluation session over a [`Net`].
//!
//! An extractor binds input blobs, then resolves each requested blob by
//! running its producer after recursively resolving the producer's bottoms.
//! Computed blobs are memoized for the lifetime of the session. In lightmode
//! a blob is dropped as soon as its last consumer has taken it, so its
//! storage returns to the pool; asking for a dropped blob again runs its
//! producer again.

use std::sync::Arc;

use log::{debug, warn};

use crate::allocator::Allocator;
use crate::config::RuntimeConfig;
use crate::errors::{LayerResult, NetError, NetResult};
use crate::layers::cast::{cast_float16_to_float32, cast_float32_to_float16};
use crate::layers::LayerFlags;
use crate::mat::{convert_packing, Mat};
use crate::net::Net;

/// Channel interleave used when packed layout is enabled.
const PACK_WIDTH: usize = 4;

pub struct Extractor<'a> {
    net: &'a Net,
    config: RuntimeConfig,
    blob_mats: Vec<Option<Mat>>,
    /// Reads still pending on each blob before lightmode may drop it.
    remaining_reads: Vec<usize>,
    poisoned: bool,
}

impl<'a> Extractor<'a> {
    pub(crate) fn new(net: &'a Net, config: RuntimeConfig) -> Self {
        let blob_count = net.blobs().len();
        Self {
            net,
            config,
            blob_mats: vec![None; blob_count],
            remaining_reads: net.blobs().iter().map(|b| b.consumers().len()).collect(),
            poisoned: false,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn set_light_mode(&mut self, enabled: bool) {
        self.config.lightmode = enabled;
    }

    pub fn set_num_threads(&mut self, num_threads: usize) {
        self.config.num_threads = num_threads.max(1);
    }

    pub fn set_blob_allocator(&mut self, allocator: Arc<dyn Allocator>) {
        self.config.blob_allocator = Some(allocator);
    }

    pub fn set_workspace_allocator(&mut self, allocator: Arc<dyn Allocator>) {
        self.config.workspace_allocator = Some(allocator);
    }

    pub fn set_int8_inference(&mut self, enabled: bool) {
        self.config.use_int8_inference = enabled;
    }

    pub fn set_packing_layout(&mut self, enabled: bool) {
        self.config.use_packing_layout = enabled;
    }

    pub fn set_fp16_storage(&mut self, enabled: bool) {
        self.config.use_fp16_storage = enabled;
    }

    /// True once an extraction has failed; every later call is refused.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Binds `mat` to the named blob.
    pub fn input(&mut self, name: &str, mat: Mat) -> NetResult<()> {
        let index = self.resolve(name)?;
        self.input_index(index, mat)
    }

    pub fn input_index(&mut self, index: usize, mat: Mat) -> NetResult<()> {
        self.check_usable(index)?;
        self.blob_mats[index] = Some(mat);
        self.remaining_reads[index] = self.net.blobs()[index].consumers().len();
        Ok(())
    }

    /// Computes the named blob and returns it unpacked, as f32 when it holds
    /// floating point data.
    pub fn extract(&mut self, name: &str) -> NetResult<Mat> {
        let index = self.resolve(name)?;
        self.extract_index(index)
    }

    pub fn extract_index(&mut self, index: usize) -> NetResult<Mat> {
        self.check_usable(index)?;
        match self.resolve_blob(index).and_then(|mat| self.to_output_layout(mat)) {
            Ok(mat) => Ok(mat),
            Err(e) => {
                warn!("Extraction of {} failed: {e}", self.net.blobs()[index].name());
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn resolve(&self, name: &str) -> NetResult<usize> {
        if self.poisoned {
            return Err(NetError::SessionPoisoned);
        }
        self.net.blob_index(name).ok_or_else(|| NetError::BlobNotFound {
            name: name.to_string(),
        })
    }

    fn check_usable(&self, index: usize) -> NetResult<()> {
        if self.poisoned {
            return Err(NetError::SessionPoisoned);
        }
        let count = self.blob_mats.len();
        if index >= count {
            return Err(NetError::BlobIndexOutOfBounds { index, count });
        }
        Ok(())
    }

    fn missing_input(&self, blob: usize) -> NetError {
        NetError::MissingInput {
            name: self.net.blobs()[blob].name().to_string(),
        }
    }

    /// Current content of a blob, running its producer if needed.
    fn resolve_blob(&mut self, blob: usize) -> NetResult<Mat> {
        if self.blob_mats[blob].is_none() {
            let producer = self.net.blobs()[blob]
                .producer()
                .ok_or_else(|| self.missing_input(blob))?;
            self.forward_layer(producer)?;
        }
        self.blob_mats[blob]
            .clone()
            .ok_or_else(|| self.missing_input(blob))
    }

    fn forward_layer(&mut self, layer_index: usize) -> NetResult<()> {
        let net = self.net;
        let node = &net.layers()[layer_index];
        if node.is_input() {
            return Err(self.missing_input(node.tops()[0]));
        }

        for &blob in node.bottoms() {
            if self.blob_mats[blob].is_none() {
                let producer = net.blobs()[blob]
                    .producer()
                    .ok_or_else(|| self.missing_input(blob))?;
                self.forward_layer(producer)?;
            }
        }

        let flags = node.layer().flags();
        let mut bottoms = Vec::with_capacity(node.bottoms().len());
        for &blob in node.bottoms() {
            let mat = self.take_bottom(blob)?;
            let mat = self
                .to_layer_layout(mat, flags)
                .map_err(|e| NetError::layer(node.name(), e))?;
            bottoms.push(mat);
        }

        debug!("Running layer {} ({})", node.name(), node.type_name());
        let layer = node.layer();
        let config = &self.config;
        let result = if flags.support_inplace {
            let mut blobs = bottoms;
            let status = if flags.one_blob_only {
                match blobs.first_mut() {
                    Some(blob) => layer.forward_inplace(blob, config),
                    None => Ok(()),
                }
            } else {
                layer.forward_inplace_multi(&mut blobs, config)
            };
            status.map(|()| blobs)
        } else if flags.one_blob_only {
            match bottoms.first() {
                Some(bottom) => layer.forward(bottom, config).map(|top| vec![top]),
                None => Ok(Vec::new()),
            }
        } else {
            let mut tops = vec![Mat::default(); node.tops().len()];
            layer
                .forward_multi(&bottoms, &mut tops, config)
                .map(|()| tops)
        };
        let tops = result.map_err(|e| NetError::layer(node.name(), e))?;

        for (&blob, top) in node.tops().iter().zip(tops) {
            let top = self
                .to_storage_layout(top)
                .map_err(|e| NetError::layer(node.name(), e))?;
            self.blob_mats[blob] = Some(top);
            self.remaining_reads[blob] = net.blobs()[blob].consumers().len();
        }
        Ok(())
    }

    /// Hands a bottom to its consumer. In lightmode the last read moves the
    /// blob out of the table; caller-bound inputs are always kept.
    fn take_bottom(&mut self, blob: usize) -> NetResult<Mat> {
        let remaining = self.remaining_reads[blob].saturating_sub(1);
        self.remaining_reads[blob] = remaining;

        let net = self.net;
        let info = &net.blobs()[blob];
        let release = self.config.lightmode && remaining == 0 && !net.is_input_blob(info);
        let mat = if release {
            debug!("Releasing blob {}", info.name());
            self.blob_mats[blob].take()
        } else {
            self.blob_mats[blob].clone()
        };
        mat.ok_or_else(|| self.missing_input(blob))
    }

    /// Converts a bottom to the element type and packing the layer accepts.
    fn to_layer_layout(&self, mat: Mat, flags: LayerFlags) -> LayerResult<Mat> {
        let opt = &self.config;
        let mat = if mat.scalar_size() == 2 && !flags.support_fp16_storage {
            cast_float16_to_float32(&mat, opt)?
        } else {
            mat
        };

        if mat.elempack() > 1 && !flags.support_packing {
            return convert_packing(&mat, 1, opt.blob_allocator());
        }
        if opt.use_packing_layout
            && flags.support_packing
            && mat.elempack() == 1
            && mat.dims() == 3
            && mat.scalar_size() != 1
            && mat.c() % PACK_WIDTH == 0
        {
            return convert_packing(&mat, PACK_WIDTH, opt.blob_allocator());
        }
        Ok(mat)
    }

    /// Applies fp16 storage to a freshly produced float blob.
    fn to_storage_layout(&self, mat: Mat) -> LayerResult<Mat> {
        if self.config.use_fp16_storage && mat.scalar_size() == 4 && !mat.is_empty() {
            return cast_float32_to_float16(&mat, &self.config);
        }
        Ok(mat)
    }

    fn to_output_layout(&self, mat: Mat) -> NetResult<Mat> {
        let opt = &self.config;
        let convert = || -> LayerResult<Mat> {
            let mat = if mat.elempack() > 1 {
                convert_packing(&mat, 1, opt.blob_allocator())?
            } else {
                mat.clone()
            };
            if mat.scalar_size() == 2 {
                return cast_float16_to_float32(&mat, opt);
            }
            Ok(mat)
        };
        convert().map_err(|e| NetError::layer("output", e))
    }
}
