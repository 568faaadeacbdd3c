//! Tensor container shared by every layer.
//!
//! A [`Mat`] describes up to three logical dimensions (`w`, `h`, `c`) plus an
//! element pack width. Storage is reference counted: cloning a `Mat` yields a
//! new view on the same block, and mutable access copies the data first when
//! the block is shared. When the last view is dropped the block goes back to
//! the allocator that produced it.
//!
//! Channels are stored back to back with `cstep = w * h` packed elements each,
//! so a 3-D mat is also a contiguous buffer of `w * h * c` packed elements.

mod border;
mod packing;

pub use border::{copy_make_border, BorderPads};
pub use packing::convert_packing;

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use crate::allocator::{Allocator, MemoryBlock};
use crate::errors::{LayerError, LayerResult};

/// Storage block plus the allocator it must be returned to.
struct MatStorage {
    block: MemoryBlock,
    allocator: Option<Arc<dyn Allocator>>,
}

impl MatStorage {
    fn allocate(size: usize, allocator: Option<&Arc<dyn Allocator>>) -> LayerResult<Self> {
        let block = match allocator {
            Some(allocator) => allocator.fast_malloc(size)?,
            None => MemoryBlock::allocate(size)?,
        };
        Ok(Self {
            block,
            allocator: allocator.cloned(),
        })
    }
}

impl Drop for MatStorage {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            allocator.fast_free(std::mem::take(&mut self.block));
        }
    }
}

impl fmt::Debug for MatStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatStorage")
            .field("size", &self.block.size())
            .field("pooled", &self.allocator.is_some())
            .finish()
    }
}

/// Reference-counted tensor view.
#[derive(Clone, Debug, Default)]
pub struct Mat {
    storage: Option<Arc<MatStorage>>,
    /// Byte offset of the first element inside the storage block.
    offset: usize,
    dims: usize,
    w: usize,
    h: usize,
    c: usize,
    elemsize: usize,
    elempack: usize,
}

impl Mat {
    /// Allocates a 1-D mat of `w` elements.
    pub fn create_1d(
        w: usize,
        elemsize: usize,
        allocator: Option<&Arc<dyn Allocator>>,
    ) -> LayerResult<Self> {
        Self::create_shape(1, w, 1, 1, elemsize, 1, allocator)
    }

    /// Allocates a 2-D mat of `h` rows of `w` elements.
    pub fn create_2d(
        w: usize,
        h: usize,
        elemsize: usize,
        allocator: Option<&Arc<dyn Allocator>>,
    ) -> LayerResult<Self> {
        Self::create_shape(2, w, h, 1, elemsize, 1, allocator)
    }

    /// Allocates a 3-D mat of `c` channels of `w * h` elements.
    pub fn create_3d(
        w: usize,
        h: usize,
        c: usize,
        elemsize: usize,
        allocator: Option<&Arc<dyn Allocator>>,
    ) -> LayerResult<Self> {
        Self::create_shape(3, w, h, c, elemsize, 1, allocator)
    }

    /// Allocates a 3-D mat whose elements interleave `elempack` lanes.
    ///
    /// `elemsize` is the size of one packed element, i.e. lanes times the
    /// scalar size.
    pub fn create_3d_packed(
        w: usize,
        h: usize,
        c: usize,
        elemsize: usize,
        elempack: usize,
        allocator: Option<&Arc<dyn Allocator>>,
    ) -> LayerResult<Self> {
        Self::create_shape(3, w, h, c, elemsize, elempack, allocator)
    }

    /// Allocates a mat with the shape and packing of `other` and a new element size.
    pub fn create_like(
        other: &Mat,
        elemsize: usize,
        allocator: Option<&Arc<dyn Allocator>>,
    ) -> LayerResult<Self> {
        Self::create_shape(
            other.dims,
            other.w,
            other.h,
            other.c,
            elemsize,
            other.elempack,
            allocator,
        )
    }

    fn create_shape(
        dims: usize,
        w: usize,
        h: usize,
        c: usize,
        elemsize: usize,
        elempack: usize,
        allocator: Option<&Arc<dyn Allocator>>,
    ) -> LayerResult<Self> {
        let bytes = w * h * c * elemsize;
        let storage = if bytes == 0 {
            None
        } else {
            Some(Arc::new(MatStorage::allocate(bytes, allocator)?))
        };
        Ok(Self {
            storage,
            offset: 0,
            dims,
            w,
            h,
            c,
            elemsize,
            elempack: elempack.max(1),
        })
    }

    /// Builds a 1-D mat holding a copy of `data`.
    pub fn from_slice_1d<T: Pod>(data: &[T]) -> LayerResult<Self> {
        let mut mat = Self::create_1d(data.len(), size_of::<T>(), None)?;
        mat.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(mat)
    }

    /// Builds a 3-D mat holding a copy of `data`, laid out channel by channel.
    pub fn from_slice_3d<T: Pod>(w: usize, h: usize, c: usize, data: &[T]) -> LayerResult<Self> {
        if data.len() != w * h * c {
            return Err(LayerError::shape("mat data", w * h * c, data.len()));
        }
        let mut mat = Self::create_3d(w, h, c, size_of::<T>(), None)?;
        mat.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(mat)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn w(&self) -> usize {
        self.w
    }

    pub fn h(&self) -> usize {
        self.h
    }

    pub fn c(&self) -> usize {
        self.c
    }

    pub fn elemsize(&self) -> usize {
        self.elemsize
    }

    pub fn elempack(&self) -> usize {
        self.elempack
    }

    /// Packed elements between the starts of two consecutive channels.
    pub fn cstep(&self) -> usize {
        self.w * self.h
    }

    /// Packed elements in the whole mat.
    pub fn total(&self) -> usize {
        self.cstep() * self.c
    }

    /// Size of one scalar lane in bytes.
    pub fn scalar_size(&self) -> usize {
        self.elemsize / self.elempack.max(1)
    }

    pub fn byte_len(&self) -> usize {
        self.total() * self.elemsize
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_none() || self.total() == 0
    }

    /// Number of views sharing this mat's storage.
    pub fn ref_count(&self) -> usize {
        self.storage.as_ref().map_or(0, Arc::strong_count)
    }

    /// Allocator the storage returns to when released.
    pub fn allocator(&self) -> Option<Arc<dyn Allocator>> {
        self.storage
            .as_ref()
            .and_then(|storage| storage.allocator.clone())
    }

    /// Drops this view's reference to the storage.
    pub fn release(&mut self) {
        *self = Self::default();
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Some(storage) => &storage.block.bytes()[self.offset..self.offset + self.byte_len()],
            None => &[],
        }
    }

    /// Mutable bytes of this view, copying the storage first when it is shared.
    pub fn as_bytes_mut(&mut self) -> LayerResult<&mut [u8]> {
        self.make_unique()?;
        let range = self.offset..self.offset + self.byte_len();
        match self.storage.as_mut().and_then(Arc::get_mut) {
            Some(storage) => Ok(&mut storage.block.bytes_mut()[range]),
            None => Ok(&mut []),
        }
    }

    /// Typed view of every scalar lane.
    ///
    /// Panics if `T` does not have the scalar size of this mat.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        debug_assert!(self.elemsize == 0 || size_of::<T>() == self.scalar_size());
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Mutable typed view of every scalar lane.
    pub fn as_mut_slice<T: Pod>(&mut self) -> LayerResult<&mut [T]> {
        debug_assert!(self.elemsize == 0 || size_of::<T>() == self.scalar_size());
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()?))
    }

    /// Typed view of the scalar lanes of channel `q`.
    pub fn channel_slice<T: Pod>(&self, q: usize) -> &[T] {
        let lanes = self.cstep() * self.elempack;
        &self.as_slice::<T>()[q * lanes..(q + 1) * lanes]
    }

    /// 2-D view of channel `q`.
    pub fn channel(&self, q: usize) -> Mat {
        Mat {
            storage: self.storage.clone(),
            offset: self.offset + q * self.cstep() * self.elemsize,
            dims: 2,
            w: self.w,
            h: self.h,
            c: 1,
            elemsize: self.elemsize,
            elempack: self.elempack,
        }
    }

    /// 3-D view of `n` consecutive channels starting at `q`.
    pub fn channel_range(&self, q: usize, n: usize) -> Mat {
        Mat {
            storage: self.storage.clone(),
            offset: self.offset + q * self.cstep() * self.elemsize,
            dims: 3,
            w: self.w,
            h: self.h,
            c: n,
            elemsize: self.elemsize,
            elempack: self.elempack,
        }
    }

    /// 1-D view of `n` elements starting at `start`.
    pub fn range(&self, start: usize, n: usize) -> Mat {
        Mat {
            storage: self.storage.clone(),
            offset: self.offset + start * self.elemsize,
            dims: 1,
            w: n,
            h: 1,
            c: 1,
            elemsize: self.elemsize,
            elempack: self.elempack,
        }
    }

    /// Reinterprets the elements with a new shape, sharing the storage.
    pub fn reshape(&self, w: usize, h: usize, c: usize) -> LayerResult<Mat> {
        if w * h * c != self.total() {
            return Err(LayerError::shape("reshape", self.total(), w * h * c));
        }
        let dims = if c > 1 {
            3
        } else if h > 1 {
            2
        } else {
            1
        };
        Ok(Mat {
            storage: self.storage.clone(),
            offset: self.offset,
            dims,
            w,
            h,
            c,
            elemsize: self.elemsize,
            elempack: self.elempack,
        })
    }

    /// Sets every scalar lane to `value`.
    pub fn fill<T: Pod>(&mut self, value: T) -> LayerResult<()> {
        self.as_mut_slice::<T>()?.fill(value);
        Ok(())
    }

    /// Copies this view into freshly allocated storage.
    pub fn clone_deep(&self, allocator: Option<&Arc<dyn Allocator>>) -> LayerResult<Mat> {
        let mut mat = Self::create_shape(
            self.dims,
            self.w,
            self.h,
            self.c,
            self.elemsize,
            self.elempack,
            allocator,
        )?;
        mat.as_bytes_mut()?.copy_from_slice(self.as_bytes());
        Ok(mat)
    }

    fn make_unique(&mut self) -> LayerResult<()> {
        let shared = match self.storage.as_mut() {
            Some(storage) => Arc::get_mut(storage).is_none(),
            None => false,
        };
        if shared {
            let allocator = self.allocator();
            *self = self.clone_deep(allocator.as_ref())?;
        }
        Ok(())
    }
}
