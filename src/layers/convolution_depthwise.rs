//! Grouped and depthwise 2-D convolution.
//!
//! Input and output channels are split into `group` independent
//! sub-convolutions. The fully depthwise arrangement
//! (`channels == group == num_output`) runs a one-channel kernel; every other
//! arrangement runs the general grouped kernel. Both walk a flat list of
//! kernel-tap offsets precomputed for the padded input width.
//!
//! When int8 inference is enabled and the layer carries quantization scales,
//! the input is quantized per group, accumulated in 32-bit integers and then
//! either dequantized back to floats or requantized to int8 for a downstream
//! int8 consumer. Quantized weights and the per-group quantization ops are
//! built once in `create_pipeline`.

use std::ops::{Add, Mul};

use log::{debug, warn};

use crate::activation::Activation;
use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::layers::{Dequantize, Layer, LayerFlags, Quantize, Requantize};
use crate::mat::{copy_make_border, BorderPads, Mat};
use crate::model_bin::{ModelBin, TYPE_FLAGGED, TYPE_RAW_F32};
use crate::param_dict::ParamDict;
use crate::parallel::parallel_chunks_mut;

/// Pad value selecting SAME padding with the odd pixel at the back.
pub const PAD_SAME_UPPER: i32 = -233;
/// Pad value selecting SAME padding with the odd pixel at the front.
pub const PAD_SAME_LOWER: i32 = -234;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(ConvolutionDepthWise::default())
}

/// How the input border is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Explicit {
        left: usize,
        right: usize,
        top: usize,
        bottom: usize,
    },
    /// Pads so that `out = ceil(in / stride)`; the back absorbs the odd pixel.
    SameUpper,
    /// Pads so that `out = ceil(in / stride)`; the front absorbs the odd pixel.
    SameLower,
}

impl Default for Padding {
    fn default() -> Self {
        Padding::Explicit {
            left: 0,
            right: 0,
            top: 0,
            bottom: 0,
        }
    }
}

/// Total SAME padding along one axis.
pub fn same_pad_total(extent: usize, kernel_extent: usize, stride: usize) -> usize {
    let covered = kernel_extent + extent.saturating_sub(1) / stride * stride;
    covered.saturating_sub(extent)
}

impl Padding {
    fn from_params(left: i32, right: i32, top: i32, bottom: i32) -> LayerResult<Self> {
        let all = |v: i32| left == v && right == v && top == v && bottom == v;
        if all(PAD_SAME_UPPER) {
            return Ok(Padding::SameUpper);
        }
        if all(PAD_SAME_LOWER) {
            return Ok(Padding::SameLower);
        }

        let side = |key: usize, v: i32| {
            usize::try_from(v).map_err(|_| LayerError::InvalidParam {
                key,
                reason: format!("pad {v} must be non-negative, -233 or -234 on every side"),
            })
        };
        Ok(Padding::Explicit {
            left: side(4, left)?,
            right: side(15, right)?,
            top: side(14, top)?,
            bottom: side(16, bottom)?,
        })
    }

    /// Border to apply to a `w` x `h` input.
    pub fn resolve(
        &self,
        w: usize,
        h: usize,
        kernel_extent_w: usize,
        kernel_extent_h: usize,
        stride_w: usize,
        stride_h: usize,
    ) -> BorderPads {
        let split = |total: usize, front_absorbs: bool| {
            let half = total / 2;
            if front_absorbs {
                (total - half, half)
            } else {
                (half, total - half)
            }
        };

        match *self {
            Padding::Explicit {
                left,
                right,
                top,
                bottom,
            } => BorderPads {
                top,
                bottom,
                left,
                right,
            },
            Padding::SameUpper | Padding::SameLower => {
                let front_absorbs = *self == Padding::SameLower;
                let (left, right) = split(same_pad_total(w, kernel_extent_w, stride_w), front_absorbs);
                let (top, bottom) = split(same_pad_total(h, kernel_extent_h, stride_h), front_absorbs);
                BorderPads {
                    top,
                    bottom,
                    left,
                    right,
                }
            }
        }
    }
}

/// Hyperparameters read by `load_param`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvolutionParams {
    pub num_output: usize,
    pub kernel_w: usize,
    pub kernel_h: usize,
    pub dilation_w: usize,
    pub dilation_h: usize,
    pub stride_w: usize,
    pub stride_h: usize,
    pub padding: Padding,
    pub pad_value: f32,
    pub bias_term: bool,
    pub weight_data_size: usize,
    pub group: usize,
    pub int8_scale_term: i32,
    pub activation: Activation,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            num_output: 0,
            kernel_w: 0,
            kernel_h: 0,
            dilation_w: 1,
            dilation_h: 1,
            stride_w: 1,
            stride_h: 1,
            padding: Padding::default(),
            pad_value: 0.0,
            bias_term: false,
            weight_data_size: 0,
            group: 1,
            int8_scale_term: 0,
            activation: Activation::Identity,
        }
    }
}

fn positive(pd: &ParamDict, key: usize, default: i32) -> LayerResult<usize> {
    let value = pd.get_int(key, default);
    match usize::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(LayerError::InvalidParam {
            key,
            reason: format!("{value} must be positive"),
        }),
    }
}

impl ConvolutionParams {
    /// Reads the parameter keys shared by every convolution layer.
    pub fn from_param_dict(pd: &ParamDict) -> LayerResult<Self> {
        let num_output = positive(pd, 0, 0)?;
        let kernel_w = positive(pd, 1, 0)?;
        let kernel_h = positive(pd, 11, kernel_w as i32)?;
        let dilation_w = positive(pd, 2, 1)?;
        let dilation_h = positive(pd, 12, dilation_w as i32)?;
        let stride_w = positive(pd, 3, 1)?;
        let stride_h = positive(pd, 13, stride_w as i32)?;

        let pad_left = pd.get_int(4, 0);
        let pad_right = pd.get_int(15, pad_left);
        let pad_top = pd.get_int(14, pad_left);
        let pad_bottom = pd.get_int(16, pad_top);
        let padding = Padding::from_params(pad_left, pad_right, pad_top, pad_bottom)?;

        let weight_data_size =
            usize::try_from(pd.get_int(6, 0)).map_err(|_| LayerError::InvalidParam {
                key: 6,
                reason: "weight_data_size must not be negative".to_string(),
            })?;
        let group = positive(pd, 7, 1)?;

        let int8_scale_term = pd.get_int(8, 0);
        if !matches!(int8_scale_term, 0 | 1 | 2) {
            return Err(LayerError::InvalidParam {
                key: 8,
                reason: format!("unknown int8 scale term {int8_scale_term}"),
            });
        }

        let activation = Activation::from_params(pd.get_int(9, 0), &pd.get_array(10, &[]), 9)?;

        Ok(Self {
            num_output,
            kernel_w,
            kernel_h,
            dilation_w,
            dilation_h,
            stride_w,
            stride_h,
            padding,
            pad_value: pd.get_float(18, 0.0),
            bias_term: pd.get_int(5, 0) != 0,
            weight_data_size,
            group,
            int8_scale_term,
            activation,
        })
    }

    pub fn kernel_extent_w(&self) -> usize {
        self.dilation_w * (self.kernel_w - 1) + 1
    }

    pub fn kernel_extent_h(&self) -> usize {
        self.dilation_h * (self.kernel_h - 1) + 1
    }

    /// Taps per kernel window.
    pub fn maxk(&self) -> usize {
        self.kernel_w * self.kernel_h
    }

    /// Input channels implied by the weight count, used in error reports.
    fn implied_channels(&self) -> usize {
        let per_input = self.maxk() * self.num_output;
        if per_input == 0 {
            0
        } else {
            self.weight_data_size * self.group / per_input
        }
    }
}

/// Flat offsets of every kernel tap from the window origin, row by row.
pub fn kernel_offsets(
    src_w: usize,
    kernel_w: usize,
    kernel_h: usize,
    dilation_w: usize,
    dilation_h: usize,
) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(kernel_w * kernel_h);
    for i in 0..kernel_h {
        for j in 0..kernel_w {
            offsets.push(i * dilation_h * src_w + j * dilation_w);
        }
    }
    offsets
}

/// Loop structure used for the accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKernel {
    /// One input channel per output channel.
    Depthwise,
    /// `channels / group` input channels per output channel.
    Grouped,
}

/// Shape of one convolution call over an already padded input.
#[derive(Debug, Clone)]
pub struct ConvGeometry {
    pub src_w: usize,
    pub src_cstep: usize,
    pub outw: usize,
    pub outh: usize,
    pub stride_w: usize,
    pub stride_h: usize,
    pub channels_g: usize,
    pub num_output_g: usize,
    pub offsets: Vec<usize>,
}

impl ConvGeometry {
    pub fn out_cstep(&self) -> usize {
        self.outw * self.outh
    }

    fn maxk(&self) -> usize {
        self.offsets.len()
    }
}

/// Accumulates `init + sum(src * weight)` for every output channel.
///
/// `out` holds `num_output` channels of `outw * outh` accumulators. Output
/// channels are distributed over `num_threads` workers.
pub fn convolve<T, A>(
    geometry: &ConvGeometry,
    kernel: ConvKernel,
    src: &[T],
    weights: &[T],
    init: impl Fn(usize) -> A + Sync,
    num_threads: usize,
    out: &mut [A],
) where
    T: Copy + Sync,
    A: Copy + Send + From<T> + Add<Output = A> + Mul<Output = A>,
{
    let g = geometry;
    let maxk = g.maxk();
    parallel_chunks_mut(num_threads, out, g.out_cstep(), |oc, outptr| {
        let bias = init(oc);
        match kernel {
            ConvKernel::Depthwise => {
                let m = &src[oc * g.src_cstep..];
                let kptr = &weights[oc * maxk..(oc + 1) * maxk];
                for i in 0..g.outh {
                    for j in 0..g.outw {
                        let base = i * g.stride_h * g.src_w + j * g.stride_w;
                        let mut sum = bias;
                        for (&ofs, &k) in g.offsets.iter().zip(kptr) {
                            sum = sum + A::from(m[base + ofs]) * A::from(k);
                        }
                        outptr[i * g.outw + j] = sum;
                    }
                }
            }
            ConvKernel::Grouped => {
                let group = oc / g.num_output_g;
                let kbase = &weights[oc * g.channels_g * maxk..(oc + 1) * g.channels_g * maxk];
                for i in 0..g.outh {
                    for j in 0..g.outw {
                        let base = i * g.stride_h * g.src_w + j * g.stride_w;
                        let mut sum = bias;
                        for q in 0..g.channels_g {
                            let m = &src[(group * g.channels_g + q) * g.src_cstep..];
                            let kptr = &kbase[q * maxk..(q + 1) * maxk];
                            for (&ofs, &k) in g.offsets.iter().zip(kptr) {
                                sum = sum + A::from(m[base + ofs]) * A::from(k);
                            }
                        }
                        outptr[i * g.outw + j] = sum;
                    }
                }
            }
        }
    });
}

/// State derived from the scales once per pipeline.
#[derive(Debug, Clone)]
struct Int8Pipeline {
    weights: Vec<i8>,
    quantize_ops: Vec<Quantize>,
    dequantize_ops: Vec<Dequantize>,
    requantize_ops: Vec<Requantize>,
}

/// Grouped convolution layer; depthwise when every group has one channel.
#[derive(Debug, Clone)]
pub struct ConvolutionDepthWise {
    params: ConvolutionParams,
    /// Outcome of the last `load_param`; forward refuses to run on an error.
    param_status: Result<(), LayerError>,
    weight_data: Mat,
    bias_data: Vec<f32>,
    weight_data_int8_scales: Vec<f32>,
    bottom_blob_int8_scales: Vec<f32>,
    use_int8_requantize: bool,
    top_blob_int8_scale: f32,
    int8: Option<Int8Pipeline>,
}

impl Default for ConvolutionDepthWise {
    fn default() -> Self {
        Self {
            params: ConvolutionParams::default(),
            param_status: Err(LayerError::MissingWeights {
                reason: "parameters not loaded".to_string(),
            }),
            weight_data: Mat::default(),
            bias_data: Vec::new(),
            weight_data_int8_scales: Vec::new(),
            bottom_blob_int8_scales: Vec::new(),
            use_int8_requantize: false,
            top_blob_int8_scale: 0.0,
            int8: None,
        }
    }
}

impl ConvolutionDepthWise {
    pub fn params(&self) -> &ConvolutionParams {
        &self.params
    }

    pub fn weight_data(&self) -> &Mat {
        &self.weight_data
    }

    pub fn bias_data(&self) -> &[f32] {
        &self.bias_data
    }

    /// Whether `create_pipeline` set up the int8 path.
    pub fn has_int8_pipeline(&self) -> bool {
        self.int8.is_some()
    }

    pub fn use_int8_requantize(&self) -> bool {
        self.use_int8_requantize
    }

    fn bias_slice(&self, group: usize) -> Vec<f32> {
        if self.bias_data.is_empty() {
            return Vec::new();
        }
        let num_output_g = self.params.num_output / self.params.group;
        self.bias_data[group * num_output_g..(group + 1) * num_output_g].to_vec()
    }

    fn rescale(&self, group: usize) -> f32 {
        Dequantize::rescale(
            self.bottom_blob_int8_scales[group],
            self.weight_data_int8_scales[group],
        )
    }

    /// One requantize op per group. Only valid once int8 requantize is enabled.
    pub fn create_requantize_ops(&self) -> LayerResult<Vec<Requantize>> {
        if !self.use_int8_requantize {
            warn!("Requantize op requested while int8 requantize is disabled");
            return Err(LayerError::RequantizeDisabled);
        }
        let fusion_relu = self.params.activation == Activation::Relu;
        Ok((0..self.params.group)
            .map(|g| {
                Requantize::new(
                    self.rescale(g),
                    self.top_blob_int8_scale,
                    self.bias_slice(g),
                    fusion_relu,
                )
            })
            .collect())
    }

    fn build_int8_pipeline(&self, opt: &RuntimeConfig) -> LayerResult<Int8Pipeline> {
        let group = self.params.group;
        if self.weight_data_int8_scales.len() != group || self.bottom_blob_int8_scales.len() != group {
            return Err(LayerError::MissingWeights {
                reason: format!("int8 inference needs {group} weight and input scales"),
            });
        }

        let weights = if self.weight_data.elemsize() == 1 {
            self.weight_data.as_slice::<i8>().to_vec()
        } else {
            let nested = opt.for_nested();
            let per_group = self.params.weight_data_size / group;
            let mut weights = Vec::with_capacity(self.params.weight_data_size);
            for (g, &scale) in self.weight_data_int8_scales.iter().enumerate() {
                let group_weights = self.weight_data.range(g * per_group, per_group);
                let quantized = Quantize::new(scale).forward(&group_weights, &nested)?;
                weights.extend_from_slice(quantized.as_slice::<i8>());
            }
            weights
        };

        let quantize_ops = self
            .bottom_blob_int8_scales
            .iter()
            .map(|&scale| Quantize::new(scale))
            .collect();
        let dequantize_ops = (0..group)
            .map(|g| Dequantize::new(self.rescale(g), self.bias_slice(g)))
            .collect();
        let requantize_ops = if self.use_int8_requantize {
            self.create_requantize_ops()?
        } else {
            Vec::new()
        };

        Ok(Int8Pipeline {
            weights,
            quantize_ops,
            dequantize_ops,
            requantize_ops,
        })
    }

    fn quantize_input(
        &self,
        bottom: &Mat,
        pipeline: &Int8Pipeline,
        channels_g: usize,
        opt: &RuntimeConfig,
    ) -> LayerResult<Mat> {
        let mut quantized = Mat::create_like(bottom, 1, opt.workspace_allocator())?;
        let src = bottom.as_slice::<f32>();
        let group_len = channels_g * bottom.cstep();
        parallel_chunks_mut(
            opt.num_threads,
            quantized.as_mut_slice::<i8>()?,
            group_len,
            |g, dst| {
                let start = g * group_len;
                pipeline.quantize_ops[g].quantize_into(&src[start..start + dst.len()], dst);
            },
        );
        Ok(quantized)
    }
}

impl Layer for ConvolutionDepthWise {
    fn type_name(&self) -> &'static str {
        "ConvolutionDepthWise"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: true,
            support_gpu: true,
            ..LayerFlags::default()
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        let status = ConvolutionParams::from_param_dict(pd).and_then(|params| {
            self.params = params;
            if params.num_output % params.group != 0 {
                return Err(LayerError::InvalidGroup {
                    channels: params.implied_channels(),
                    num_output: params.num_output,
                    group: params.group,
                });
            }
            Ok(())
        });
        if let Err(e) = &status {
            warn!("Rejected convolution parameters: {e}");
        }
        self.param_status = status.clone();
        status
    }

    fn load_model(&mut self, mb: &mut dyn ModelBin) -> LayerResult<()> {
        self.param_status.clone()?;
        let params = self.params;

        self.weight_data = mb.load_1d(params.weight_data_size, TYPE_FLAGGED)?;
        self.bias_data = if params.bias_term {
            mb.load_1d(params.num_output, TYPE_RAW_F32)?
                .as_slice::<f32>()
                .to_vec()
        } else {
            Vec::new()
        };

        match params.int8_scale_term {
            1 => {
                let weight_scales = mb.load_1d(params.group, TYPE_RAW_F32)?;
                let bottom_scale = mb.load_1d(1, TYPE_RAW_F32)?;
                self.weight_data_int8_scales = weight_scales.as_slice::<f32>().to_vec();
                self.bottom_blob_int8_scales = vec![bottom_scale.as_slice::<f32>()[0]; params.group];
            }
            2 => {
                let weight_scale = mb.load_1d(1, TYPE_RAW_F32)?;
                let bottom_scale = mb.load_1d(1, TYPE_RAW_F32)?;
                self.weight_data_int8_scales = vec![weight_scale.as_slice::<f32>()[0]; params.group];
                self.bottom_blob_int8_scales = vec![bottom_scale.as_slice::<f32>()[0]; params.group];
            }
            _ => {
                self.weight_data_int8_scales.clear();
                self.bottom_blob_int8_scales.clear();
            }
        }
        Ok(())
    }

    fn create_pipeline(&mut self, opt: &RuntimeConfig) -> LayerResult<()> {
        self.int8 = None;
        let int8_weights = self.weight_data.elemsize() == 1;
        if int8_weights && !opt.use_int8_inference {
            warn!("Convolution holds int8 weights but int8 inference is disabled");
            return Err(LayerError::Int8WeightsWithoutInt8Inference);
        }
        if !opt.use_int8_inference || (!int8_weights && self.params.int8_scale_term == 0) {
            return Ok(());
        }

        let pipeline = self.build_int8_pipeline(opt)?;
        debug!(
            "Built int8 pipeline over {} groups (requantize: {})",
            self.params.group, self.use_int8_requantize
        );
        self.int8 = Some(pipeline);
        Ok(())
    }

    fn destroy_pipeline(&mut self, _opt: &RuntimeConfig) -> LayerResult<()> {
        self.int8 = None;
        Ok(())
    }

    fn int8_input_scale(&self) -> Option<f32> {
        self.int8.as_ref()?;
        let (&first, rest) = self.bottom_blob_int8_scales.split_first()?;
        rest.iter().all(|&s| s == first).then_some(first)
    }

    fn enable_int8_requantize(&mut self, top_scale: f32) -> LayerResult<()> {
        if self.int8.is_none() {
            warn!("Int8 requantize requested on a convolution without an int8 pipeline");
            return Err(LayerError::RequantizeDisabled);
        }
        if !matches!(self.params.activation, Activation::Identity | Activation::Relu) {
            return Err(LayerError::RequantizeDisabled);
        }

        self.use_int8_requantize = true;
        self.top_blob_int8_scale = top_scale;
        let ops = self.create_requantize_ops()?;
        if let Some(pipeline) = self.int8.as_mut() {
            pipeline.requantize_ops = ops;
        }
        Ok(())
    }

    fn forward(&self, bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
        self.param_status.clone()?;
        let p = &self.params;

        if bottom.elempack() != 1 {
            return Err(LayerError::UnsupportedElemSize {
                elemsize: bottom.elemsize(),
                operation: "convolution on packed data".to_string(),
            });
        }

        let (w, h, channels) = (bottom.w(), bottom.h(), bottom.c());
        if channels % p.group != 0 || p.num_output % p.group != 0 {
            return Err(LayerError::InvalidGroup {
                channels,
                num_output: p.num_output,
                group: p.group,
            });
        }
        let channels_g = channels / p.group;
        let num_output_g = p.num_output / p.group;
        let maxk = p.maxk();

        let expected_weights = maxk * channels_g * p.num_output;
        if self.weight_data.total() != expected_weights {
            return Err(LayerError::shape(
                "convolution weights",
                expected_weights,
                self.weight_data.total(),
            ));
        }

        let pipeline = if opt.use_int8_inference {
            self.int8.as_ref()
        } else {
            None
        };
        if pipeline.is_none() && self.weight_data.elemsize() == 1 {
            return Err(LayerError::Int8WeightsWithoutInt8Inference);
        }

        let source = match (pipeline, bottom.elemsize()) {
            (Some(int8), 4) => self.quantize_input(bottom, int8, channels_g, opt)?,
            (Some(_), 1) | (None, 4) => bottom.clone(),
            (_, elemsize) => {
                return Err(LayerError::UnsupportedElemSize {
                    elemsize,
                    operation: "convolution input".to_string(),
                });
            }
        };

        let (extent_w, extent_h) = (p.kernel_extent_w(), p.kernel_extent_h());
        let pads = p
            .padding
            .resolve(w, h, extent_w, extent_h, p.stride_w, p.stride_h);
        let bordered = copy_make_border(&source, pads, p.pad_value, opt.workspace_allocator())?;
        if bordered.w() < extent_w {
            return Err(LayerError::shape("convolution input width", extent_w, bordered.w()));
        }
        if bordered.h() < extent_h {
            return Err(LayerError::shape("convolution input height", extent_h, bordered.h()));
        }

        let geometry = ConvGeometry {
            src_w: bordered.w(),
            src_cstep: bordered.cstep(),
            outw: (bordered.w() - extent_w) / p.stride_w + 1,
            outh: (bordered.h() - extent_h) / p.stride_h + 1,
            stride_w: p.stride_w,
            stride_h: p.stride_h,
            channels_g,
            num_output_g,
            offsets: kernel_offsets(bordered.w(), p.kernel_w, p.kernel_h, p.dilation_w, p.dilation_h),
        };
        let kernel = if channels == p.group && p.group == p.num_output {
            ConvKernel::Depthwise
        } else {
            ConvKernel::Grouped
        };
        let out_cstep = geometry.out_cstep();
        let (outw, outh) = (geometry.outw, geometry.outh);

        let Some(int8) = pipeline else {
            let mut top = Mat::create_3d(outw, outh, p.num_output, 4, opt.blob_allocator())?;
            let bias = &self.bias_data;
            let activation = p.activation;
            let out = top.as_mut_slice::<f32>()?;
            convolve(
                &geometry,
                kernel,
                bordered.as_slice::<f32>(),
                self.weight_data.as_slice::<f32>(),
                |oc| bias.get(oc).copied().unwrap_or(0.0),
                opt.num_threads,
                out,
            );
            if !activation.is_identity() {
                parallel_chunks_mut(opt.num_threads, out, out_cstep, |_, values| {
                    activation.apply_in_place(values)
                });
            }
            return Ok(top);
        };

        let src = bordered.as_slice::<i8>();
        if self.use_int8_requantize {
            let mut acc = Mat::create_3d(outw, outh, p.num_output, 4, opt.workspace_allocator())?;
            convolve(
                &geometry,
                kernel,
                src,
                &int8.weights,
                |_| 0i32,
                opt.num_threads,
                acc.as_mut_slice::<i32>()?,
            );

            let mut top = Mat::create_3d(outw, outh, p.num_output, 1, opt.blob_allocator())?;
            let acc = acc.as_slice::<i32>();
            parallel_chunks_mut(opt.num_threads, top.as_mut_slice::<i8>()?, out_cstep, |oc, dst| {
                let start = oc * out_cstep;
                int8.requantize_ops[oc / num_output_g].requantize_channel(
                    &acc[start..start + out_cstep],
                    dst,
                    oc % num_output_g,
                );
            });
            return Ok(top);
        }

        let mut top = Mat::create_3d(outw, outh, p.num_output, 4, opt.blob_allocator())?;
        let out = top.as_mut_slice::<i32>()?;
        convolve(&geometry, kernel, src, &int8.weights, |_| 0i32, opt.num_threads, out);
        let activation = p.activation;
        parallel_chunks_mut(opt.num_threads, out, out_cstep, |oc, values| {
            int8.dequantize_ops[oc / num_output_g].dequantize_channel_in_place(values, oc % num_output_g);
            activation.apply_in_place(bytemuck::cast_slice_mut(values));
        });
        Ok(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::STATUS_CONFIG_ERROR;
    use crate::model_bin::ModelBinFromMatArray;

    fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((state >> 16) % 200) as f32 / 100.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_same_padding_split_parity() {
        // 3x3 kernel, stride 2, width 6: total pad 1
        assert_eq!(same_pad_total(6, 3, 2), 1);
        let upper = Padding::SameUpper.resolve(6, 6, 3, 3, 2, 2);
        assert_eq!((upper.left, upper.right), (0, 1));
        let lower = Padding::SameLower.resolve(6, 6, 3, 3, 2, 2);
        assert_eq!((lower.left, lower.right), (1, 0));

        // 4x4 kernel, stride 1: total pad 3
        let upper = Padding::SameUpper.resolve(5, 5, 4, 4, 1, 1);
        assert_eq!((upper.top, upper.bottom), (1, 2));
        let lower = Padding::SameLower.resolve(5, 5, 4, 4, 1, 1);
        assert_eq!((lower.top, lower.bottom), (2, 1));
    }

    #[test]
    fn test_padding_from_params() {
        assert_eq!(Padding::from_params(-233, -233, -233, -233).unwrap(), Padding::SameUpper);
        assert_eq!(Padding::from_params(-234, -234, -234, -234).unwrap(), Padding::SameLower);
        assert!(matches!(
            Padding::from_params(-233, 0, 0, 0),
            Err(LayerError::InvalidParam { key: 4, .. })
        ));
    }

    #[test]
    fn test_kernel_offsets_with_dilation() {
        assert_eq!(kernel_offsets(10, 2, 2, 2, 3), vec![0, 2, 30, 32]);
    }

    #[test]
    fn test_invalid_group_leaves_layer_unusable() {
        let mut layer = ConvolutionDepthWise::default();
        let pd = ParamDict::new()
            .with_int(0, 10)
            .with_int(1, 3)
            .with_int(6, 90)
            .with_int(7, 3);
        let status = layer.load_param(&pd);
        assert!(matches!(status, Err(LayerError::InvalidGroup { num_output: 10, group: 3, .. })));
        assert_eq!(status.unwrap_err().status_code(), STATUS_CONFIG_ERROR);

        let bottom = Mat::from_slice_3d(3, 3, 3, &[0.0f32; 27]).unwrap();
        assert!(layer.forward(&bottom, &RuntimeConfig::new()).is_err());
    }

    #[test]
    fn test_depthwise_matches_grouped_kernel() {
        let configs = [
            // (w, h, channels, kernel, dilation, stride)
            (7, 6, 3, 3, 1, 1),
            (9, 9, 4, 3, 2, 2),
            (8, 5, 2, 2, 1, 3),
            (5, 5, 5, 1, 1, 1),
        ];
        for (seed, &(w, h, channels, k, d, s)) in configs.iter().enumerate() {
            let src = pseudo_random(w * h * channels, seed as u32);
            let weights = pseudo_random(k * k * channels, 100 + seed as u32);
            let extent = d * (k - 1) + 1;
            let geometry = ConvGeometry {
                src_w: w,
                src_cstep: w * h,
                outw: (w - extent) / s + 1,
                outh: (h - extent) / s + 1,
                stride_w: s,
                stride_h: s,
                channels_g: 1,
                num_output_g: 1,
                offsets: kernel_offsets(w, k, k, d, d),
            };
            let len = geometry.out_cstep() * channels;

            let mut depthwise = vec![0.0f32; len];
            let mut grouped = vec![0.0f32; len];
            convolve(&geometry, ConvKernel::Depthwise, &src, &weights, |oc| oc as f32, 3, &mut depthwise);
            convolve(&geometry, ConvKernel::Grouped, &src, &weights, |oc| oc as f32, 1, &mut grouped);
            assert_eq!(depthwise, grouped);

            let src8: Vec<i8> = src.iter().map(|v| (v * 100.0) as i8).collect();
            let weights8: Vec<i8> = weights.iter().map(|v| (v * 100.0) as i8).collect();
            let mut depthwise8 = vec![0i32; len];
            let mut grouped8 = vec![0i32; len];
            convolve(&geometry, ConvKernel::Depthwise, &src8, &weights8, |_| 0i32, 2, &mut depthwise8);
            convolve(&geometry, ConvKernel::Grouped, &src8, &weights8, |_| 0i32, 1, &mut grouped8);
            assert_eq!(depthwise8, grouped8);
        }
    }

    fn loaded_layer(pd: ParamDict, mats: Vec<Mat>, opt: &RuntimeConfig) -> ConvolutionDepthWise {
        let mut layer = ConvolutionDepthWise::default();
        layer.load_param(&pd).unwrap();
        layer
            .load_model(&mut ModelBinFromMatArray::new(mats))
            .unwrap();
        layer.create_pipeline(opt).unwrap();
        layer
    }

    #[test]
    fn test_grouped_two_channels_per_group() {
        // 4 input channels, 2 groups, 2 outputs: each output sums its group's two channels
        let pd = ParamDict::new()
            .with_int(0, 2)
            .with_int(1, 1)
            .with_int(5, 1)
            .with_int(6, 4)
            .with_int(7, 2);
        let opt = RuntimeConfig::new().with_threads(1);
        let layer = loaded_layer(
            pd,
            vec![
                Mat::from_slice_1d(&[1.0f32, 2.0, 3.0, 4.0]).unwrap(),
                Mat::from_slice_1d(&[0.5f32, -0.5]).unwrap(),
            ],
            &opt,
        );

        let bottom = Mat::from_slice_3d(1, 1, 4, &[1.0f32, 1.0, 2.0, 2.0]).unwrap();
        let top = layer.forward(&bottom, &opt).unwrap();
        assert_eq!(top.as_slice::<f32>(), &[3.5, 13.5]);
    }

    #[test]
    fn test_same_upper_keeps_spatial_size() {
        let pd = ParamDict::new()
            .with_int(0, 2)
            .with_int(1, 3)
            .with_int(4, PAD_SAME_UPPER)
            .with_int(6, 18)
            .with_int(7, 2)
            .with_float(18, 1.0);
        let opt = RuntimeConfig::new();
        let layer = loaded_layer(pd, vec![Mat::from_slice_1d(&[1.0f32; 18]).unwrap()], &opt);

        let bottom = Mat::from_slice_3d(4, 4, 2, &[0.0f32; 32]).unwrap();
        let top = layer.forward(&bottom, &opt).unwrap();
        assert_eq!((top.w(), top.h(), top.c()), (4, 4, 2));
        // the corner window covers five border pixels of value 1
        assert_eq!(top.as_slice::<f32>()[0], 5.0);
        assert_eq!(top.as_slice::<f32>()[5], 0.0);
    }

    #[test]
    fn test_int8_path_tracks_float_path() {
        let (w, channels) = (6, 4);
        let src = pseudo_random(w * w * channels, 7);
        let weights = pseudo_random(9 * channels, 8);
        let bias = vec![0.1f32, -0.2, 0.3, 0.0];
        let pd = ParamDict::new()
            .with_int(0, 4)
            .with_int(1, 3)
            .with_int(5, 1)
            .with_int(6, 36)
            .with_int(7, 4)
            .with_int(8, 1)
            .with_int(9, 1);

        let weight_scales = vec![127.0f32; channels];
        let mats = vec![
            Mat::from_slice_1d(&weights).unwrap(),
            Mat::from_slice_1d(&bias).unwrap(),
            Mat::from_slice_1d(&weight_scales).unwrap(),
            Mat::from_slice_1d(&[127.0f32]).unwrap(),
        ];
        let opt = RuntimeConfig::new().with_threads(2);
        let layer = loaded_layer(pd, mats, &opt);
        assert!(layer.has_int8_pipeline());
        assert_eq!(layer.int8_input_scale(), Some(127.0));

        let bottom = Mat::from_slice_3d(w, w, channels, &src).unwrap();
        let quantized = layer.forward(&bottom, &opt).unwrap();
        let float = layer
            .forward(&bottom, &opt.clone().with_int8_inference(false))
            .unwrap();

        assert_eq!(quantized.elemsize(), 4);
        for (q, f) in quantized.as_slice::<f32>().iter().zip(float.as_slice::<f32>()) {
            assert!(*q >= 0.0);
            assert!((q - f).abs() < 0.1, "int8 {q} vs float {f}");
        }
    }

    #[test]
    fn test_zero_weight_scale_yields_bias_only() {
        let pd = ParamDict::new()
            .with_int(0, 1)
            .with_int(1, 1)
            .with_int(5, 1)
            .with_int(6, 1)
            .with_int(8, 2);
        let mats = vec![
            Mat::from_slice_1d(&[1.0f32]).unwrap(),
            Mat::from_slice_1d(&[0.25f32]).unwrap(),
            Mat::from_slice_1d(&[0.0f32]).unwrap(),
            Mat::from_slice_1d(&[10.0f32]).unwrap(),
        ];
        let opt = RuntimeConfig::new();
        let layer = loaded_layer(pd, mats, &opt);
        let bottom = Mat::from_slice_3d(2, 1, 1, &[3.0f32, -3.0]).unwrap();
        let top = layer.forward(&bottom, &opt).unwrap();
        assert_eq!(top.as_slice::<f32>(), &[0.25, 0.25]);
    }

    #[test]
    fn test_int8_weights_require_int8_inference() {
        let pd = ParamDict::new().with_int(0, 1).with_int(1, 1).with_int(6, 1).with_int(8, 2);
        let mut layer = ConvolutionDepthWise::default();
        layer.load_param(&pd).unwrap();
        layer
            .load_model(&mut ModelBinFromMatArray::new(vec![
                Mat::from_slice_1d(&[5i8]).unwrap(),
                Mat::from_slice_1d(&[1.0f32]).unwrap(),
                Mat::from_slice_1d(&[1.0f32]).unwrap(),
            ]))
            .unwrap();

        let status = layer.create_pipeline(&RuntimeConfig::new().with_int8_inference(false));
        assert_eq!(status, Err(LayerError::Int8WeightsWithoutInt8Inference));
    }

    #[test]
    fn test_requantize_requires_int8_pipeline() {
        let pd = ParamDict::new().with_int(0, 1).with_int(1, 1).with_int(6, 1);
        let opt = RuntimeConfig::new();
        let mut layer = loaded_layer(pd, vec![Mat::from_slice_1d(&[1.0f32]).unwrap()], &opt);
        assert_eq!(layer.create_requantize_ops().unwrap_err(), LayerError::RequantizeDisabled);
        assert_eq!(layer.enable_int8_requantize(1.0), Err(LayerError::RequantizeDisabled));
    }

    #[test]
    fn test_requantized_output_is_int8() {
        let pd = ParamDict::new()
            .with_int(0, 2)
            .with_int(1, 1)
            .with_int(6, 2)
            .with_int(7, 2)
            .with_int(8, 1)
            .with_int(9, 1);
        let mats = vec![
            Mat::from_slice_1d(&[1.0f32, -1.0]).unwrap(),
            Mat::from_slice_1d(&[100.0f32, 100.0]).unwrap(),
            Mat::from_slice_1d(&[50.0f32]).unwrap(),
        ];
        let opt = RuntimeConfig::new();
        let mut layer = loaded_layer(pd, mats, &opt);
        layer.enable_int8_requantize(20.0).unwrap();
        assert!(layer.use_int8_requantize());

        let bottom = Mat::from_slice_3d(2, 1, 2, &[0.5f32, -0.5, 0.5, -0.5]).unwrap();
        let top = layer.forward(&bottom, &opt).unwrap();
        assert_eq!(top.elemsize(), 1);
        // channel 0 keeps x, channel 1 negates it; fused relu clamps negatives
        assert_eq!(top.as_slice::<i8>(), &[10, 0, 0, 10]);
    }
}
