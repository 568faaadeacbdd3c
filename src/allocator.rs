//! Pooled allocators for tensor storage.
//!
//! A pool keeps every block released by a [`crate::mat::Mat`] on a free list and
//! hands it out again to a later request of a compatible size, so repeated
//! inferences settle into a steady state without going back to the system
//! allocator. Blocks only return to the system on [`PoolAllocator::clear`] or
//! when the pool is dropped.
//!
//! A free block of `N` bytes is reused for a request of `M` bytes iff
//! `M <= N` and `N * ratio <= M`, with `ratio` in `(0, 1]`. A ratio of `0`
//! only accepts blocks of exactly `M` bytes. Sizes are rounded up to a multiple
//! of four bytes before matching.

use std::fmt;
use std::sync::{Mutex, MutexGuard, TryLockError};

use log::{debug, warn};

use crate::errors::{LayerError, LayerResult};

/// Default ratio of workspace pools: a block may be up to twice the request.
pub const WORKSPACE_SIZE_COMPARE_RATIO: f32 = 0.5;

/// Rounds a byte size up to the storage granularity of a [`MemoryBlock`].
pub fn aligned_size(size: usize) -> usize {
    size.div_ceil(4) * 4
}

/// Returns whether a free block of `block_size` bytes satisfies a request of
/// `requested` bytes under the given size compare ratio.
pub fn block_matches(block_size: usize, requested: usize, ratio: f32) -> bool {
    if ratio <= 0.0 {
        return block_size == requested;
    }
    block_size >= requested && (block_size as f64) * (ratio as f64) <= requested as f64
}

/// A block of storage handed out by an allocator.
///
/// Backed by 32-bit words so that typed views of `f32`, `i32`, `u16` and `i8`
/// elements are always correctly aligned.
#[derive(Debug, Default)]
pub struct MemoryBlock {
    words: Vec<u32>,
}

impl MemoryBlock {
    /// Allocates a zeroed block of at least `size` bytes from the system.
    pub fn allocate(size: usize) -> LayerResult<Self> {
        let word_count = size.div_ceil(4);
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| LayerError::AllocationFailure { bytes: size })?;
        words.resize(word_count, 0);
        Ok(Self { words })
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize {
        self.words.len() * 4
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }
}

/// Source of tensor storage.
///
/// Implementations must be shareable across threads because a single
/// [`crate::config::RuntimeConfig`] is handed to every layer of a session.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Returns a block of at least `size` bytes.
    fn fast_malloc(&self, size: usize) -> LayerResult<MemoryBlock>;

    /// Takes back a block previously returned by [`Allocator::fast_malloc`].
    fn fast_free(&self, block: MemoryBlock);
}

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks currently waiting on the free list.
    pub free_blocks: usize,
    /// Bytes held by the free list.
    pub free_bytes: usize,
    /// Blocks handed out and not yet released.
    pub outstanding_blocks: usize,
    /// Bytes obtained from the system and not yet returned to it.
    pub system_bytes: usize,
    /// Requests served from the free list.
    pub reused: u64,
}

#[derive(Debug)]
struct PoolState {
    free: Vec<MemoryBlock>,
    size_compare_ratio: f32,
    capacity_limit: Option<usize>,
    stats: PoolStats,
}

impl PoolState {
    fn new(size_compare_ratio: f32) -> Self {
        Self {
            free: Vec::new(),
            size_compare_ratio,
            capacity_limit: None,
            stats: PoolStats::default(),
        }
    }

    fn malloc(&mut self, size: usize) -> LayerResult<MemoryBlock> {
        let requested = aligned_size(size);
        let ratio = self.size_compare_ratio;

        if let Some(position) = self
            .free
            .iter()
            .position(|block| block_matches(block.size(), requested, ratio))
        {
            let block = self.free.swap_remove(position);
            self.stats.free_blocks -= 1;
            self.stats.free_bytes -= block.size();
            self.stats.outstanding_blocks += 1;
            self.stats.reused += 1;
            return Ok(block);
        }

        if let Some(limit) = self.capacity_limit {
            if self.stats.system_bytes + requested > limit {
                return Err(LayerError::AllocationFailure { bytes: requested });
            }
        }

        let block = MemoryBlock::allocate(requested)?;
        self.stats.system_bytes += block.size();
        self.stats.outstanding_blocks += 1;
        Ok(block)
    }

    fn free(&mut self, block: MemoryBlock) {
        self.stats.outstanding_blocks = self.stats.outstanding_blocks.saturating_sub(1);
        self.stats.free_blocks += 1;
        self.stats.free_bytes += block.size();
        self.free.push(block);
    }

    fn clear(&mut self) {
        debug!(
            "Releasing {} pooled blocks ({} bytes)",
            self.stats.free_blocks, self.stats.free_bytes
        );
        self.stats.system_bytes = self.stats.system_bytes.saturating_sub(self.stats.free_bytes);
        self.stats.free_blocks = 0;
        self.stats.free_bytes = 0;
        self.free.clear();
    }

    fn set_size_compare_ratio(&mut self, ratio: f32) {
        if !(0.0..=1.0).contains(&ratio) {
            warn!("Ignoring size compare ratio {ratio} outside [0, 1]");
            return;
        }
        self.size_compare_ratio = ratio;
    }
}

/// Mutex-guarded pool, safe to share between concurrently running sessions.
#[derive(Debug)]
pub struct PoolAllocator {
    state: Mutex<PoolState>,
}

impl PoolAllocator {
    /// Creates a pool that only reuses blocks of exactly the requested size.
    pub fn new() -> Self {
        Self::with_size_compare_ratio(0.0)
    }

    /// Creates a pool with the looser matching used for workspace buffers.
    pub fn for_workspace() -> Self {
        Self::with_size_compare_ratio(WORKSPACE_SIZE_COMPARE_RATIO)
    }

    /// Creates a pool with an explicit size compare ratio in `[0, 1]`.
    pub fn with_size_compare_ratio(ratio: f32) -> Self {
        let mut state = PoolState::new(0.0);
        state.set_size_compare_ratio(ratio);
        Self {
            state: Mutex::new(state),
        }
    }

    /// Caps the bytes this pool may obtain from the system.
    pub fn with_capacity_limit(self, bytes: usize) -> Self {
        self.lock().capacity_limit = Some(bytes);
        self
    }

    pub fn set_size_compare_ratio(&self, ratio: f32) {
        self.lock().set_size_compare_ratio(ratio);
    }

    pub fn size_compare_ratio(&self) -> f32 {
        self.lock().size_compare_ratio
    }

    /// Returns every free block to the system.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for PoolAllocator {
    fn fast_malloc(&self, size: usize) -> LayerResult<MemoryBlock> {
        self.lock().malloc(size)
    }

    fn fast_free(&self, block: MemoryBlock) {
        self.lock().free(block);
    }
}

/// Pool for sessions that are guaranteed not to run concurrently.
///
/// Never blocks. If the guarantee is broken and two threads reach the pool at
/// the same time, the losing request bypasses the pool: it allocates straight
/// from the system, and a contended release drops its block.
#[derive(Debug)]
pub struct UnlockedPoolAllocator {
    state: Mutex<PoolState>,
}

impl UnlockedPoolAllocator {
    /// Creates a pool that only reuses blocks of exactly the requested size.
    pub fn new() -> Self {
        Self::with_size_compare_ratio(0.0)
    }

    /// Creates a pool with the looser matching used for workspace buffers.
    pub fn for_workspace() -> Self {
        Self::with_size_compare_ratio(WORKSPACE_SIZE_COMPARE_RATIO)
    }

    pub fn with_size_compare_ratio(ratio: f32) -> Self {
        let mut state = PoolState::new(0.0);
        state.set_size_compare_ratio(ratio);
        Self {
            state: Mutex::new(state),
        }
    }

    /// Caps the bytes this pool may obtain from the system.
    pub fn with_capacity_limit(self, bytes: usize) -> Self {
        if let Some(mut state) = self.try_state() {
            state.capacity_limit = Some(bytes);
        }
        self
    }

    pub fn set_size_compare_ratio(&self, ratio: f32) {
        if let Some(mut state) = self.try_state() {
            state.set_size_compare_ratio(ratio);
        }
    }

    pub fn size_compare_ratio(&self) -> f32 {
        self.try_state()
            .map(|state| state.size_compare_ratio)
            .unwrap_or_default()
    }

    /// Returns every free block to the system.
    pub fn clear(&self) {
        if let Some(mut state) = self.try_state() {
            state.clear();
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.try_state().map(|state| state.stats).unwrap_or_default()
    }

    fn try_state(&self) -> Option<MutexGuard<'_, PoolState>> {
        match self.state.try_lock() {
            Ok(state) => Some(state),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                warn!("Unlocked pool allocator accessed concurrently; bypassing the pool");
                None
            }
        }
    }
}

impl Default for UnlockedPoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for UnlockedPoolAllocator {
    fn fast_malloc(&self, size: usize) -> LayerResult<MemoryBlock> {
        match self.try_state() {
            Some(mut state) => state.malloc(size),
            None => MemoryBlock::allocate(aligned_size(size)),
        }
    }

    fn fast_free(&self, block: MemoryBlock) {
        if let Some(mut state) = self.try_state() {
            state.free(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_matches_exact() {
        assert!(block_matches(64, 64, 0.0));
        assert!(!block_matches(68, 64, 0.0));
        assert!(!block_matches(60, 64, 0.0));
    }

    #[test]
    fn test_block_matches_ratio() {
        assert!(block_matches(128, 64, 0.5));
        assert!(!block_matches(132, 64, 0.5));
        assert!(!block_matches(60, 64, 0.5));
        assert!(block_matches(64, 64, 1.0));
        assert!(!block_matches(68, 64, 1.0));
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(1), 4);
        assert_eq!(aligned_size(8), 8);
        assert_eq!(aligned_size(9), 12);
    }

    #[test]
    fn test_pool_reuses_released_block() {
        let pool = PoolAllocator::new();
        let block = pool.fast_malloc(256).unwrap();
        pool.fast_free(block);
        assert_eq!(pool.stats().free_blocks, 1);

        let block = pool.fast_malloc(256).unwrap();
        assert_eq!(block.size(), 256);
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.system_bytes, 256);
    }

    #[test]
    fn test_pool_clear_returns_memory() {
        let pool = PoolAllocator::for_workspace();
        let a = pool.fast_malloc(100).unwrap();
        let b = pool.fast_malloc(200).unwrap();
        pool.fast_free(a);
        pool.fast_free(b);
        assert_eq!(pool.stats().system_bytes, 300);

        pool.clear();
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.system_bytes, 0);
    }

    #[test]
    fn test_capacity_limit() {
        let pool = PoolAllocator::new().with_capacity_limit(128);
        let block = pool.fast_malloc(100).unwrap();
        assert!(matches!(
            pool.fast_malloc(64),
            Err(LayerError::AllocationFailure { bytes: 64 })
        ));
        pool.fast_free(block);
        assert!(pool.fast_malloc(100).is_ok());
    }

    #[test]
    fn test_invalid_ratio_is_ignored() {
        let pool = PoolAllocator::with_size_compare_ratio(0.75);
        pool.set_size_compare_ratio(1.5);
        assert_eq!(pool.size_compare_ratio(), 0.75);
    }

    #[test]
    fn test_unlocked_pool_reuse() {
        let pool = UnlockedPoolAllocator::for_workspace();
        let block = pool.fast_malloc(400).unwrap();
        pool.fast_free(block);
        let block = pool.fast_malloc(300).unwrap();
        assert_eq!(block.size(), 400);
        assert_eq!(pool.stats().reused, 1);
    }
}
