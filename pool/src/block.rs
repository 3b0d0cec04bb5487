//! Raw storage backing every [crate::Buffer].

use std::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout},
    ptr::NonNull,
};
use tracing::error;

/// Returns the cache line size for the current architecture.
///
/// Uses 128 bytes for x86_64 and aarch64 as a conservative estimate that
/// accounts for spatial prefetching. Uses 64 bytes for other architectures.
pub(crate) const fn cache_line_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// An owned, aligned heap region.
///
/// The region is zeroed when first carved from the heap and keeps whatever it
/// last held when recycled. Deallocates itself on drop using the stored layout.
pub(crate) struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: RawBlock owns its memory and can be sent between threads.
unsafe impl Send for RawBlock {}
// SAFETY: RawBlock's memory is only reachable through `&self`/`&mut self`.
unsafe impl Sync for RawBlock {}

impl RawBlock {
    /// Carves a new block of `capacity` bytes from the heap.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. Aborts the process if no layout can describe the
    /// request (including a non power-of-two `alignment`) or the heap refuses it.
    pub(crate) fn new(capacity: usize, alignment: usize) -> Self {
        assert!(capacity > 0, "block capacity must be non-zero");
        let Ok(layout) = Layout::from_size_align(capacity, alignment) else {
            error!(capacity, alignment, "invalid block layout");
            std::process::abort();
        };

        // SAFETY: Layout is valid (non-zero size, power-of-two alignment).
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        Self { ptr, layout }
    }

    /// Returns the capacity of the block.
    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns a raw pointer to the start of the block.
    #[inline]
    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the first `len` bytes of the block.
    #[inline]
    pub(crate) fn slice(&self, len: usize) -> &[u8] {
        assert!(len <= self.capacity());
        // SAFETY: the block is initialized (zeroed on creation) and `len` is in bounds.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    /// Returns the first `len` bytes of the block, mutably.
    #[inline]
    pub(crate) fn slice_mut(&mut self, len: usize) -> &mut [u8] {
        assert!(len <= self.capacity());
        // SAFETY: the block is initialized, `len` is in bounds and we hold `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), len) }
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_block_alignment() {
        let cache_line = cache_line_size();
        let block = RawBlock::new(16, cache_line);
        assert_eq!(block.capacity(), 16);
        assert!((block.as_ptr() as usize).is_multiple_of(cache_line));

        let block = RawBlock::new(3, 1);
        assert_eq!(block.capacity(), 3);
    }

    #[test]
    fn test_raw_block_zeroed() {
        let mut block = RawBlock::new(64, 8);
        assert!(block.slice(64).iter().all(|&b| b == 0));

        block.slice_mut(4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(block.slice(4), &[1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "block capacity must be non-zero")]
    fn test_raw_block_zero_capacity() {
        RawBlock::new(0, 8);
    }
}
