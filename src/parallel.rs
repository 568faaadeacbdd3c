//! Data-parallel fan-out inside a single layer call.
//!
//! Work items are handed out through an atomic counter to at most
//! `num_threads` scoped workers. Items write to disjoint memory, so no locking
//! is needed. A thread count of one runs everything on the calling thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

struct SendPtr<T> {
    ptr: *mut T,
}

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SendPtr<T> {}

impl<T> SendPtr<T> {
    fn new(ptr: *mut T) -> Self {
        Self { ptr }
    }

    /// # Safety
    /// The range must lie inside the original slice and must not overlap any
    /// other range handed out concurrently.
    unsafe fn as_slice_mut<'a>(self, offset: usize, len: usize) -> &'a mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }
}

unsafe impl<T: Send> Send for SendPtr<T> {}
unsafe impl<T: Send> Sync for SendPtr<T> {}

/// Runs `f(i)` for every `i` in `0..n`.
pub fn parallel_for<F>(num_threads: usize, n: usize, f: F)
where
    F: Fn(usize) + Sync,
{
    let workers = num_threads.min(n);
    if workers <= 1 {
        (0..n).for_each(f);
        return;
    }

    let counter = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = counter.fetch_add(1, Ordering::Relaxed);
                    if index >= n {
                        break;
                    }
                    f(index);
                }
            });
        }
    });
}

/// Splits `data` into chunks of `chunk_len` and runs `f(chunk_index, chunk)` on each.
///
/// The last chunk is shorter when `data.len()` is not a multiple of `chunk_len`.
pub fn parallel_chunks_mut<T, F>(num_threads: usize, data: &mut [T], chunk_len: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync,
{
    if data.is_empty() || chunk_len == 0 {
        return;
    }

    let total = data.len();
    let chunks = total.div_ceil(chunk_len);
    if num_threads.min(chunks) <= 1 {
        for (index, chunk) in data.chunks_mut(chunk_len).enumerate() {
            f(index, chunk);
        }
        return;
    }

    let base = SendPtr::new(data.as_mut_ptr());
    parallel_for(num_threads, chunks, |index| {
        let start = index * chunk_len;
        let len = chunk_len.min(total - start);
        // Each index maps to its own non-overlapping range of `data`.
        let chunk = unsafe { base.as_slice_mut(start, len) };
        f(index, chunk);
    });
}
