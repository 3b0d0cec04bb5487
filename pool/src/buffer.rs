//! Buffers handed out by a pool.

use crate::block::RawBlock;
use bytes::Bytes;
use std::{
    mem::ManuallyDrop,
    ptr,
    sync::{Arc, Weak},
};

/// Implemented by pool state that can take a block back.
pub(crate) trait Reclaim: Send + Sync {
    /// Return `block`, last issued with a requested size of `size`, to the pool.
    fn reclaim(&self, size: usize, block: RawBlock);
}

/// Metadata attached to every issued block.
///
/// Rebuilt by the issuing pool each time a block is handed out (whether carved
/// fresh or recycled from a free list) and never touched on release.
pub(crate) struct Header {
    /// Usable payload size requested at allocation time.
    size: usize,
    /// Pool that must reclaim the block.
    owner: Weak<dyn Reclaim>,
}

impl Header {
    pub(crate) fn new(size: usize, owner: Weak<dyn Reclaim>) -> Self {
        Self { size, owner }
    }
}

/// A block of memory issued by a pool, together with its [Header].
///
/// The payload is the first [Buffer::size] bytes of the block. Contents are
/// zeroed when the block is first carved from the heap and are not cleared
/// when a block is recycled.
///
/// Dropping a buffer returns it to the pool that issued it. If that pool has
/// already been dropped, the storage is freed.
pub struct Buffer {
    header: Header,
    block: ManuallyDrop<RawBlock>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.header.size)
            .field("capacity", &self.block.capacity())
            .finish()
    }
}

impl Buffer {
    pub(crate) fn new(header: Header, block: RawBlock) -> Self {
        debug_assert!(header.size <= block.capacity());
        Self {
            header,
            block: ManuallyDrop::new(block),
        }
    }

    /// Returns the payload size requested at allocation time.
    #[inline]
    pub fn size(&self) -> usize {
        self.header.size
    }

    /// Returns the capacity of the underlying block (at least [Buffer::size]).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }

    /// Returns a raw pointer to the start of the payload.
    ///
    /// Stable for the lifetime of the block, which makes it usable to observe
    /// block reuse.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.block.as_ptr()
    }

    /// Returns `true` if `pool` issued this buffer.
    pub(crate) fn is_owned_by<T>(&self, pool: &Arc<T>) -> bool {
        ptr::addr_eq(self.header.owner.as_ptr(), Arc::as_ptr(pool))
    }

    /// Freezes the buffer into an immutable [Bytes] over its payload.
    ///
    /// The block is returned to its pool when every clone and slice of the
    /// result has been dropped.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }

    /// Splits the buffer into its recorded size and block without returning it
    /// to the pool.
    pub(crate) fn into_parts(self) -> (usize, RawBlock) {
        // Wrap self in ManuallyDrop first so Drop never runs for it.
        let mut me = ManuallyDrop::new(self);
        // SAFETY: me is never dropped, so the block is taken exactly once.
        let block = unsafe { ManuallyDrop::take(&mut me.block) };
        // SAFETY: me is never dropped or used again, so the owner is read exactly once.
        let owner = unsafe { ptr::read(&me.header.owner) };
        drop(owner);
        (me.header.size, block)
    }
}

impl AsRef<[u8]> for Buffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.block.slice(self.header.size)
    }
}

impl AsMut<[u8]> for Buffer {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        let size = self.header.size;
        self.block.slice_mut(size)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: Drop is only called once. into_parts() wraps self in ManuallyDrop
        // to prevent this Drop impl from running after the block is taken.
        let block = unsafe { ManuallyDrop::take(&mut self.block) };
        if let Some(pool) = self.header.owner.upgrade() {
            pool.reclaim(self.header.size, block);
        }
        // else: block is dropped here, which deallocates it
    }
}
