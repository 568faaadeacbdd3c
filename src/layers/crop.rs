//! Spatial and channel cropping.

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, LayerResult};
use crate::layers::{Layer, LayerFlags};
use crate::mat::Mat;
use crate::param_dict::ParamDict;

/// Marks a size as "everything that remains" and an offset as "centre on the
/// reference blob".
pub const CROP_AUTO: i32 = -233;

pub(crate) fn create() -> Box<dyn Layer> {
    Box::new(Crop::default())
}

/// Crops a window out of each axis.
///
/// With one bottom the window is `[offset, offset + out)` per axis, where
/// an `out` of [`CROP_AUTO`] keeps everything up to the tail offset. With a
/// second reference bottom the window takes the reference's shape, and an
/// offset of [`CROP_AUTO`] centres it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crop {
    woffset: i32,
    hoffset: i32,
    coffset: i32,
    outw: i32,
    outh: i32,
    outc: i32,
    woffset2: i32,
    hoffset2: i32,
    coffset2: i32,
}

impl Default for Crop {
    fn default() -> Self {
        Self {
            woffset: 0,
            hoffset: 0,
            coffset: 0,
            outw: CROP_AUTO,
            outh: CROP_AUTO,
            outc: CROP_AUTO,
            woffset2: 0,
            hoffset2: 0,
            coffset2: 0,
        }
    }
}

/// Window `(offset, len)` along one axis of `extent` elements.
fn resolve_axis(
    axis: &str,
    extent: usize,
    offset: i32,
    tail: i32,
    out: i32,
) -> LayerResult<(usize, usize)> {
    let offset = usize::try_from(offset).map_err(|_| LayerError::shape(axis, 0, 0))?;
    let tail = usize::try_from(tail.max(0)).unwrap_or(0);
    let remaining = extent
        .checked_sub(offset + tail)
        .ok_or_else(|| LayerError::shape(axis, extent, offset + tail))?;
    let len = if out == CROP_AUTO {
        remaining
    } else {
        usize::try_from(out).map_err(|_| LayerError::shape(axis, remaining, 0))?
    };
    if len > remaining {
        return Err(LayerError::shape(axis, remaining, len));
    }
    Ok((offset, len))
}

/// Window along one axis sized by a reference extent.
fn resolve_reference_axis(
    axis: &str,
    extent: usize,
    offset: i32,
    reference: usize,
) -> LayerResult<(usize, usize)> {
    let available = extent
        .checked_sub(reference)
        .ok_or_else(|| LayerError::shape(axis, extent, reference))?;
    let offset = if offset == CROP_AUTO {
        available / 2
    } else {
        usize::try_from(offset).map_err(|_| LayerError::shape(axis, 0, 0))?
    };
    if offset > available {
        return Err(LayerError::shape(axis, extent, offset + reference));
    }
    Ok((offset, reference))
}

impl Crop {
    fn crop(
        &self,
        bottom: &Mat,
        (x, outw): (usize, usize),
        (y, outh): (usize, usize),
        (z, outc): (usize, usize),
        opt: &RuntimeConfig,
    ) -> LayerResult<Mat> {
        if x == 0 && y == 0 && z == 0 && outw == bottom.w() && outh == bottom.h() && outc == bottom.c() {
            return Ok(bottom.clone());
        }

        let elemsize = bottom.elemsize();
        let mut top = match bottom.dims() {
            1 => Mat::create_1d(outw, elemsize, opt.blob_allocator())?,
            2 => Mat::create_2d(outw, outh, elemsize, opt.blob_allocator())?,
            _ => Mat::create_3d(outw, outh, outc, elemsize, opt.blob_allocator())?,
        };

        let src = bottom.as_bytes();
        let (w, cstep) = (bottom.w(), bottom.cstep());
        let dst = top.as_bytes_mut()?;
        let row_bytes = outw * elemsize;
        let mut dst_rows = dst.chunks_exact_mut(row_bytes.max(1));
        for q in z..z + outc {
            for i in y..y + outh {
                let start = (q * cstep + i * w + x) * elemsize;
                if let Some(row) = dst_rows.next() {
                    row.copy_from_slice(&src[start..start + row_bytes]);
                }
            }
        }
        Ok(top)
    }

    fn check_layout(bottom: &Mat) -> LayerResult<()> {
        if bottom.elempack() != 1 {
            return Err(LayerError::UnsupportedElemSize {
                elemsize: bottom.elemsize(),
                operation: "crop on packed data".to_string(),
            });
        }
        Ok(())
    }
}

impl Layer for Crop {
    fn type_name(&self) -> &'static str {
        "Crop"
    }

    fn flags(&self) -> LayerFlags {
        LayerFlags {
            one_blob_only: false,
            support_fp16_storage: true,
            ..LayerFlags::default()
        }
    }

    fn load_param(&mut self, pd: &ParamDict) -> LayerResult<()> {
        self.woffset = pd.get_int(0, 0);
        self.hoffset = pd.get_int(1, 0);
        self.coffset = pd.get_int(2, 0);
        self.outw = pd.get_int(3, CROP_AUTO);
        self.outh = pd.get_int(4, CROP_AUTO);
        self.outc = pd.get_int(5, CROP_AUTO);
        self.woffset2 = pd.get_int(6, 0);
        self.hoffset2 = pd.get_int(7, 0);
        self.coffset2 = pd.get_int(8, 0);
        Ok(())
    }

    fn forward(&self, bottom: &Mat, opt: &RuntimeConfig) -> LayerResult<Mat> {
        Self::check_layout(bottom)?;
        let dims = bottom.dims();
        let wx = resolve_axis("crop width", bottom.w(), self.woffset, self.woffset2, self.outw)?;
        let hy = if dims >= 2 {
            resolve_axis("crop height", bottom.h(), self.hoffset, self.hoffset2, self.outh)?
        } else {
            (0, bottom.h())
        };
        let cz = if dims == 3 {
            resolve_axis("crop channels", bottom.c(), self.coffset, self.coffset2, self.outc)?
        } else {
            (0, bottom.c())
        };
        self.crop(bottom, wx, hy, cz, opt)
    }

    fn forward_multi(
        &self,
        bottoms: &[Mat],
        tops: &mut [Mat],
        opt: &RuntimeConfig,
    ) -> LayerResult<()> {
        let Some(top) = tops.first_mut() else {
            return Err(LayerError::shape("crop tops", 1, 0));
        };
        let result = match bottoms {
            [bottom] => self.forward(bottom, opt)?,
            [bottom, reference] => {
                Self::check_layout(bottom)?;
                let dims = bottom.dims();
                let wx = resolve_reference_axis("crop width", bottom.w(), self.woffset, reference.w())?;
                let hy = if dims >= 2 {
                    resolve_reference_axis("crop height", bottom.h(), self.hoffset, reference.h())?
                } else {
                    (0, bottom.h())
                };
                let cz = if dims == 3 {
                    resolve_reference_axis("crop channels", bottom.c(), self.coffset, reference.c())?
                } else {
                    (0, bottom.c())
                };
                self.crop(bottom, wx, hy, cz, opt)?
            }
            _ => return Err(LayerError::shape("crop bottoms", 2, bottoms.len())),
        };
        *top = result;
        Ok(())
    }
}
