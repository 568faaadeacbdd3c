//! Element-wise numeric kernels shared by the quantization and activation layers.
//!
//! Every kernel walks its input in fixed blocks of [`LANES`] elements so the
//! compiler can keep a block in vector registers, then finishes the
//! `len % LANES` remainder with a scalar tail. Both paths apply the same scalar
//! expression, so results do not depend on where a block boundary falls.

/// Width of the main vectorized block.
pub const LANES: usize = 8;

/// Narrows a float to int8: round half away from zero, then saturate to [-127, 127].
///
/// NaN narrows to 0.
#[inline(always)]
pub fn float2int8(v: f32) -> i8 {
    let r = v.round();
    if r > 127.0 {
        127
    } else if r < -127.0 {
        -127
    } else {
        r as i8
    }
}

#[inline(always)]
fn map_lanes<S: Copy, D>(src: &[S], dst: &mut [D], f: impl Fn(S) -> D) {
    let len = src.len().min(dst.len());
    let (src, dst) = (&src[..len], &mut dst[..len]);

    let mut src_blocks = src.chunks_exact(LANES);
    let mut dst_blocks = dst.chunks_exact_mut(LANES);
    for (s, d) in (&mut src_blocks).zip(&mut dst_blocks) {
        for lane in 0..LANES {
            d[lane] = f(s[lane]);
        }
    }
    for (s, d) in src_blocks.remainder().iter().zip(dst_blocks.into_remainder()) {
        *d = f(*s);
    }
}

#[inline(always)]
fn map_lanes_in_place<T: Copy>(values: &mut [T], f: impl Fn(T) -> T) {
    let mut blocks = values.chunks_exact_mut(LANES);
    for block in &mut blocks {
        for lane in 0..LANES {
            block[lane] = f(block[lane]);
        }
    }
    for v in blocks.into_remainder() {
        *v = f(*v);
    }
}

/// `dst[i] = float2int8(src[i] * scale)`.
pub fn quantize_slice(src: &[f32], dst: &mut [i8], scale: f32) {
    map_lanes(src, dst, |v| float2int8(v * scale));
}

/// Rewrites int32 accumulators as the bit patterns of `acc * scale + bias`.
pub fn dequantize_in_place(values: &mut [i32], scale: f32, bias: f32) {
    map_lanes_in_place(values, |acc| (acc as f32 * scale + bias).to_bits() as i32);
}

/// `dst[i] = src[i] * scale + bias` from int32 accumulators into floats.
pub fn dequantize_slice(src: &[i32], dst: &mut [f32], scale: f32, bias: f32) {
    map_lanes(src, dst, |acc| acc as f32 * scale + bias);
}

/// Narrows int32 accumulators to int8 at a new scale.
///
/// The accumulator is rescaled by `scale_in` and offset by `bias`, clamped at
/// zero when `relu` is set, then multiplied by `scale_out` and narrowed.
pub fn requantize_slice(
    src: &[i32],
    dst: &mut [i8],
    scale_in: f32,
    bias: f32,
    scale_out: f32,
    relu: bool,
) {
    if relu {
        map_lanes(src, dst, |acc| {
            float2int8((acc as f32 * scale_in + bias).max(0.0) * scale_out)
        });
    } else {
        map_lanes(src, dst, |acc| float2int8((acc as f32 * scale_in + bias) * scale_out));
    }
}

/// ReLU with optional negative slope on floats.
pub fn relu_in_place(values: &mut [f32], slope: f32) {
    if slope == 0.0 {
        map_lanes_in_place(values, |v| v.max(0.0));
    } else {
        map_lanes_in_place(values, |v| if v < 0.0 { v * slope } else { v });
    }
}

/// ReLU with optional negative slope on int8 values.
pub fn relu_in_place_i8(values: &mut [i8], slope: f32) {
    if slope == 0.0 {
        map_lanes_in_place(values, |v| v.max(0));
    } else {
        map_lanes_in_place(values, |v| {
            if v < 0 { float2int8(v as f32 * slope) } else { v }
        });
    }
}

/// `values[i] = values[i] * scale + bias`.
pub fn scale_bias_in_place(values: &mut [f32], scale: f32, bias: f32) {
    map_lanes_in_place(values, |v| v * scale + bias);
}
