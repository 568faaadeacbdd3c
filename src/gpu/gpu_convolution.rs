//! Packing of a float grouped convolution for GPU execution.

use crate::gpu::errors::{GpuModelError, GpuModelResult};
use crate::layers::ConvolutionDepthWise;

/// Magic number of the packed layout ("GPCV" in little-endian).
pub const GPU_CONVOLUTION_MAGIC: u32 = 0x5643_5047;

/// Format version.
pub const GPU_CONVOLUTION_VERSION: u32 = 1;

/// Header size in f32s.
pub const HEADER_SIZE_F32S: usize = 25;

/// Largest packed layer accepted, in f32s (a 128 MiB storage buffer).
pub const MAX_GPU_LAYER_SIZE: usize = 1 << 25;

/// Largest dispatch along one axis, in workgroups.
pub const MAX_WORKGROUPS_PER_DIMENSION: usize = 65_535;

/// A convolution layer bound to one input shape, packed for the GPU.
#[derive(Debug, Clone)]
pub struct GpuConvolution {
    /// Header, weights and bias in one contiguous buffer.
    data: Vec<f32>,
    input_shape: (usize, usize, usize),
    output_shape: (usize, usize, usize),
}

impl GpuConvolution {
    /// Packs `layer` for a `w` x `h` input with the channel count its
    /// weights imply.
    pub fn from_layer(layer: &ConvolutionDepthWise, w: usize, h: usize) -> GpuModelResult<Self> {
        let p = layer.params();
        if layer.has_int8_pipeline() || layer.weight_data().elemsize() != 4 {
            return Err(GpuModelError::UnsupportedLayer {
                reason: "only float convolutions run on the GPU".to_string(),
            });
        }
        if p.group == 0 || p.num_output % p.group != 0 {
            return Err(GpuModelError::UnsupportedLayer {
                reason: format!("{} outputs cannot be split into {} groups", p.num_output, p.group),
            });
        }

        let weights = layer.weight_data().as_slice::<f32>();
        let per_input_channel = p.maxk() * p.num_output;
        let channels = if per_input_channel == 0 {
            0
        } else {
            weights.len() * p.group / per_input_channel
        };
        if channels == 0 || channels % p.group != 0 {
            return Err(GpuModelError::UnsupportedLayer {
                reason: format!("{} weights do not describe a grouped convolution", weights.len()),
            });
        }

        let (extent_w, extent_h) = (p.kernel_extent_w(), p.kernel_extent_h());
        let pads = p
            .padding
            .resolve(w, h, extent_w, extent_h, p.stride_w, p.stride_h);
        let padded_w = w + pads.left + pads.right;
        let padded_h = h + pads.top + pads.bottom;
        if padded_w < extent_w || padded_h < extent_h {
            return Err(GpuModelError::InvalidInputShape {
                w,
                h,
                c: channels,
                reason: format!("smaller than the {extent_w}x{extent_h} kernel window"),
            });
        }
        let outw = (padded_w - extent_w) / p.stride_w + 1;
        let outh = (padded_h - extent_h) / p.stride_h + 1;

        let bias = layer.bias_data();
        let weights_offset = HEADER_SIZE_F32S;
        let bias_offset = weights_offset + weights.len();
        let full_size = bias_offset + bias.len();
        if full_size > MAX_GPU_LAYER_SIZE {
            return Err(GpuModelError::ModelTooLarge {
                model_size: full_size,
                max_size: MAX_GPU_LAYER_SIZE,
            });
        }

        let as_bits = |v: usize| f32::from_bits(v as u32);
        let [activation_p0, activation_p1] = p.activation.params();
        let mut data = vec![
            f32::from_bits(GPU_CONVOLUTION_MAGIC),
            f32::from_bits(GPU_CONVOLUTION_VERSION),
            as_bits(w),
            as_bits(h),
            as_bits(channels),
            as_bits(outw),
            as_bits(outh),
            as_bits(p.num_output),
            as_bits(p.kernel_w),
            as_bits(p.kernel_h),
            as_bits(p.dilation_w),
            as_bits(p.dilation_h),
            as_bits(p.stride_w),
            as_bits(p.stride_h),
            as_bits(pads.left),
            as_bits(pads.top),
            as_bits(p.group),
            as_bits(usize::from(!bias.is_empty())),
            f32::from_bits(p.activation.type_id() as u32),
            activation_p0,
            activation_p1,
            p.pad_value,
            as_bits(weights_offset),
            as_bits(bias_offset),
            as_bits(full_size),
        ];
        data.reserve_exact(full_size - data.len());
        data.extend_from_slice(weights);
        data.extend_from_slice(bias);

        Ok(Self {
            data,
            input_shape: (w, h, channels),
            output_shape: (outw, outh, p.num_output),
        })
    }

    pub fn as_f32_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    pub fn full_size(&self) -> usize {
        self.data.len()
    }

    /// `(w, h, c)` of the unpadded input the layer was packed for.
    pub fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    /// `(w, h, c)` of the output.
    pub fn output_shape(&self) -> (usize, usize, usize) {
        self.output_shape
    }

    pub fn input_size(&self) -> usize {
        let (w, h, c) = self.input_shape;
        w * h * c
    }

    pub fn output_size(&self) -> usize {
        let (w, h, c) = self.output_shape;
        w * h * c
    }

    /// Workgroups to dispatch along x for `workgroup_size` invocations each.
    pub fn workgroup_count(&self, workgroup_size: u32) -> GpuModelResult<u32> {
        let size = workgroup_size.max(1) as usize;
        let groups = self.output_size().div_ceil(size);
        if groups > MAX_WORKGROUPS_PER_DIMENSION {
            return Err(GpuModelError::DispatchTooLarge {
                invocations: self.output_size(),
                max_invocations: MAX_WORKGROUPS_PER_DIMENSION * size,
            });
        }
        Ok(groups as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::layers::Layer;
    use crate::mat::Mat;
    use crate::model_bin::ModelBinFromMatArray;
    use crate::param_dict::ParamDict;

    fn layer(pd: ParamDict, mats: Vec<Mat>) -> ConvolutionDepthWise {
        let mut conv = ConvolutionDepthWise::default();
        conv.load_param(&pd).unwrap();
        conv.load_model(&mut ModelBinFromMatArray::new(mats)).unwrap();
        conv.create_pipeline(&RuntimeConfig::new()).unwrap();
        conv
    }

    #[test]
    fn test_header_layout() {
        let conv = layer(
            ParamDict::new()
                .with_int(0, 2)
                .with_int(1, 3)
                .with_int(4, -233)
                .with_int(5, 1)
                .with_int(6, 18)
                .with_int(7, 2)
                .with_int(9, 2)
                .with_array(10, vec![0.1]),
            vec![
                Mat::from_slice_1d(&[0.5f32; 18]).unwrap(),
                Mat::from_slice_1d(&[1.0f32, 2.0]).unwrap(),
            ],
        );
        let gpu = GpuConvolution::from_layer(&conv, 5, 4).unwrap();
        let data = gpu.as_f32_slice();

        assert_eq!(data[0].to_bits(), GPU_CONVOLUTION_MAGIC);
        assert_eq!(data[4].to_bits(), 2);
        assert_eq!(gpu.output_shape(), (5, 4, 2));
        assert_eq!(data[14].to_bits(), 1);
        assert_eq!(data[18].to_bits(), 2);
        assert!((data[19] - 0.1).abs() < 1e-7);
        assert_eq!(gpu.full_size(), HEADER_SIZE_F32S + 18 + 2);
        assert_eq!(data[24].to_bits() as usize, gpu.full_size());
        assert_eq!(&data[HEADER_SIZE_F32S + 18..], &[1.0, 2.0]);
        assert_eq!(gpu.as_bytes().len(), gpu.full_size() * 4);
    }

    #[test]
    fn test_int8_layer_rejected() {
        let conv = layer(
            ParamDict::new().with_int(0, 1).with_int(1, 1).with_int(6, 1).with_int(8, 2),
            vec![
                Mat::from_slice_1d(&[1.0f32]).unwrap(),
                Mat::from_slice_1d(&[10.0f32]).unwrap(),
                Mat::from_slice_1d(&[10.0f32]).unwrap(),
            ],
        );
        assert!(matches!(
            GpuConvolution::from_layer(&conv, 4, 4),
            Err(GpuModelError::UnsupportedLayer { .. })
        ));
    }

    #[test]
    fn test_input_smaller_than_kernel() {
        let conv = layer(
            ParamDict::new().with_int(0, 1).with_int(1, 5).with_int(6, 25),
            vec![Mat::from_slice_1d(&[1.0f32; 25]).unwrap()],
        );
        assert!(matches!(
            GpuConvolution::from_layer(&conv, 3, 3),
            Err(GpuModelError::InvalidInputShape { .. })
        ));
    }

    #[test]
    fn test_workgroup_count() {
        let conv = layer(
            ParamDict::new().with_int(0, 1).with_int(1, 1).with_int(6, 1),
            vec![Mat::from_slice_1d(&[1.0f32]).unwrap()],
        );
        let gpu = GpuConvolution::from_layer(&conv, 10, 10).unwrap();
        assert_eq!(gpu.workgroup_count(64).unwrap(), 2);
    }
}
