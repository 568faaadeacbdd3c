//! Constant-value border padding.

use std::sync::Arc;

use crate::allocator::Allocator;
use crate::errors::{LayerError, LayerResult};
use crate::kernels::float2int8;

use super::Mat;

/// Pixels added on each side of the spatial plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BorderPads {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl BorderPads {
    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }
}

/// Returns `src` surrounded by a border of `value` on every channel.
///
/// Supports unpacked `f32` mats and unpacked int8 mats; for int8 the border
/// value is narrowed with the same rounding as quantization.
pub fn copy_make_border(
    src: &Mat,
    pads: BorderPads,
    value: f32,
    allocator: Option<&Arc<dyn Allocator>>,
) -> LayerResult<Mat> {
    if pads.is_zero() {
        return Ok(src.clone());
    }
    if src.elempack() != 1 {
        return Err(LayerError::UnsupportedElemSize {
            elemsize: src.elemsize(),
            operation: "copy_make_border on packed data".to_string(),
        });
    }

    let outw = src.w() + pads.left + pads.right;
    let outh = src.h() + pads.top + pads.bottom;
    let mut dst = Mat::create_3d(outw, outh, src.c(), src.elemsize(), allocator)?;

    match src.elemsize() {
        4 => fill_border(src.as_slice::<f32>(), dst.as_mut_slice::<f32>()?, src, pads, value),
        1 => fill_border(
            src.as_slice::<i8>(),
            dst.as_mut_slice::<i8>()?,
            src,
            pads,
            float2int8(value),
        ),
        elemsize => {
            return Err(LayerError::UnsupportedElemSize {
                elemsize,
                operation: "copy_make_border".to_string(),
            });
        }
    }
    Ok(dst)
}

fn fill_border<T: Copy>(src: &[T], dst: &mut [T], shape: &Mat, pads: BorderPads, value: T) {
    let (w, h) = (shape.w(), shape.h());
    let outw = w + pads.left + pads.right;
    let outh = h + pads.top + pads.bottom;

    for (src_channel, dst_channel) in src.chunks_exact(w * h).zip(dst.chunks_exact_mut(outw * outh)) {
        dst_channel.fill(value);
        for (y, row) in src_channel.chunks_exact(w).enumerate() {
            let start = (y + pads.top) * outw + pads.left;
            dst_channel[start..start + w].copy_from_slice(row);
        }
    }
}
