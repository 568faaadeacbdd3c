//! Sequential weight sources consumed by `Layer::load_model`.
//!
//! Reads are strictly ordered: each layer pulls its tensors in the order it
//! declares them, and there is no offset table to seek with.

use half::f16;
use log::trace;

use crate::errors::{ModelBinError, ModelBinResult};
use crate::mat::Mat;

/// Storage flag of half precision weights.
pub const FLAG_FP16: u32 = 0x0130_6B47;
/// Storage flag of int8 weights.
pub const FLAG_INT8: u32 = 0x000D_4B38;

/// Weight read tagged with a storage flag word.
pub const TYPE_FLAGGED: i32 = 0;
/// Weight read of raw little-endian f32 values.
pub const TYPE_RAW_F32: i32 = 1;

/// Source of weight tensors.
pub trait ModelBin {
    /// Reads the next tensor of `w` elements.
    fn load_1d(&mut self, w: usize, type_tag: i32) -> ModelBinResult<Mat>;

    fn load_2d(&mut self, w: usize, h: usize, type_tag: i32) -> ModelBinResult<Mat> {
        let mat = self.load_1d(w * h, type_tag)?;
        mat.reshape(w, h, 1).map_err(|_| ModelBinError::SizeMismatch {
            requested: w * h,
            actual: mat.total(),
        })
    }

    fn load_3d(&mut self, w: usize, h: usize, c: usize, type_tag: i32) -> ModelBinResult<Mat> {
        let mat = self.load_1d(w * h * c, type_tag)?;
        mat.reshape(w, h, c).map_err(|_| ModelBinError::SizeMismatch {
            requested: w * h * c,
            actual: mat.total(),
        })
    }
}

/// Hands out pre-built mats in order, ignoring the type tag.
#[derive(Debug, Default)]
pub struct ModelBinFromMatArray {
    mats: Vec<Mat>,
    consumed: usize,
}

impl ModelBinFromMatArray {
    pub fn new(mats: Vec<Mat>) -> Self {
        Self { mats, consumed: 0 }
    }
}

impl ModelBin for ModelBinFromMatArray {
    fn load_1d(&mut self, w: usize, _type_tag: i32) -> ModelBinResult<Mat> {
        let mat = self
            .mats
            .get(self.consumed)
            .cloned()
            .ok_or(ModelBinError::Exhausted {
                consumed: self.consumed,
            })?;
        if mat.total() != w {
            return Err(ModelBinError::SizeMismatch {
                requested: w,
                actual: mat.total(),
            });
        }
        self.consumed += 1;
        Ok(mat.reshape(w, 1, 1).unwrap_or(mat))
    }
}

/// Reads weights from a little-endian byte stream.
#[derive(Debug)]
pub struct ModelBinFromBytes<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ModelBinFromBytes<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, len: usize) -> ModelBinResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(ModelBinError::Truncated {
                requested: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> ModelBinResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&mut self, w: usize) -> ModelBinResult<Mat> {
        let bytes = self.take(w * 4)?;
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        mat_from(&values)
    }

    fn read_fp16(&mut self, w: usize) -> ModelBinResult<Mat> {
        let bytes = self.take(align4(w * 2))?;
        let values: Vec<f32> = bytes[..w * 2]
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect();
        mat_from(&values)
    }

    fn read_int8(&mut self, w: usize) -> ModelBinResult<Mat> {
        let bytes = self.take(align4(w))?;
        let values: &[i8] = bytemuck::cast_slice(&bytes[..w]);
        mat_from(values)
    }
}

impl ModelBin for ModelBinFromBytes<'_> {
    fn load_1d(&mut self, w: usize, type_tag: i32) -> ModelBinResult<Mat> {
        match type_tag {
            TYPE_RAW_F32 => self.read_f32(w),
            TYPE_FLAGGED => {
                let flag = self.read_u32()?;
                trace!("Weight read of {w} elements with flag {flag:#010x}");
                match flag {
                    0 => self.read_f32(w),
                    FLAG_FP16 => self.read_fp16(w),
                    FLAG_INT8 => self.read_int8(w),
                    flag => Err(ModelBinError::UnknownFlag { flag }),
                }
            }
            type_tag => Err(ModelBinError::UnsupportedType { type_tag }),
        }
    }
}

fn align4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

fn mat_from<T: bytemuck::Pod>(values: &[T]) -> ModelBinResult<Mat> {
    Mat::from_slice_1d(values).map_err(|_| ModelBinError::Allocation {
        bytes: size_of_val(values),
    })
}
