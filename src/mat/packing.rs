//! Conversion between unpacked and channel-interleaved layouts.

use std::sync::Arc;

use crate::allocator::Allocator;
use crate::errors::LayerResult;

use super::Mat;

/// Repacks a 3-D mat so that each element interleaves `out_elempack` channels.
///
/// Returns `src` unchanged when it already has the requested packing, when it
/// is not 3-D, or when its channel count cannot be split evenly.
pub fn convert_packing(
    src: &Mat,
    out_elempack: usize,
    allocator: Option<&Arc<dyn Allocator>>,
) -> LayerResult<Mat> {
    let elempack = src.elempack();
    if elempack == out_elempack || src.dims() != 3 || src.is_empty() {
        return Ok(src.clone());
    }

    let channels = src.c() * elempack;
    if channels % out_elempack != 0 {
        return Ok(src.clone());
    }

    let scalar = src.scalar_size();
    let outc = channels / out_elempack;
    let size = src.cstep();
    let mut dst = Mat::create_3d_packed(
        src.w(),
        src.h(),
        outc,
        scalar * out_elempack,
        out_elempack,
        allocator,
    )?;

    let src_bytes = src.as_bytes();
    let dst_bytes = dst.as_bytes_mut()?;
    // Scalar lane (channel, i) lives at ((channel / pack) * size + i) * pack + channel % pack.
    for channel in 0..channels {
        for i in 0..size {
            let from = ((channel / elempack) * size + i) * elempack + channel % elempack;
            let to = ((channel / out_elempack) * size + i) * out_elempack + channel % out_elempack;
            dst_bytes[to * scalar..(to + 1) * scalar]
                .copy_from_slice(&src_bytes[from * scalar..(from + 1) * scalar]);
        }
    }
    Ok(dst)
}
