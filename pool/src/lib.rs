//! Hand out message buffers from size-classed and fixed-size pools without blocking.
//!
//! Two pool variants are provided:
//!
//! - [DynamicPool]: an ordered ladder of size classes, each with its own free list. Requests are
//!   rounded up to the smallest class that fits. Requests larger than every class are served
//!   directly from the heap. Allocation never fails.
//! - [FixedPool]: a single block size with a bounded number of pre-allocated blocks. When the pool
//!   is exhausted, requesters can register a [Notify] target and are served in FIFO order as
//!   buffers are released (the released block is handed directly to the oldest waiter).
//!
//! Every [Buffer] remembers the pool that issued it. Dropping a buffer (or calling
//! [Pool::release]) returns it to that pool. If the pool has already been dropped, the storage
//! is freed instead.
//!
//! # Critical Sections
//!
//! All pool bookkeeping is mutated under a [CriticalSection]. No [Notify] target is ever invoked
//! while a critical section is held, so a target is free to allocate from or release to the same
//! pool from within its delivery. A release made from within a delivery that needs to serve
//! another waiter is picked up by the hand-off already running on that thread, so a chain of
//! waiters that each release synchronously does not grow the stack.
//!
//! # Caller Obligations
//!
//! A pool never cancels a registered waiter. A requester that goes away while waiting must be
//! able to refuse delivery (see [Notify::deliver]), in which case the pool releases the buffer
//! again. The provided [Acquire] future does this automatically when dropped, and requesters
//! reporting [Notify::is_abandoned] are dropped from the wait list as new requesters queue.

use thiserror::Error;

mod block;
mod buffer;
pub use buffer::Buffer;
mod dynamic;
pub use dynamic::{Config as DynamicConfig, DynamicPool};
mod fixed;
pub use fixed::{Acquire, Allocation, Config as FixedConfig, FixedPool};
pub mod guard;
pub use guard::CriticalSection;
mod metrics;
mod notify;
pub use notify::{Callback, Notify};

/// Errors that can occur when interacting with a pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("pool closed")]
    Closed,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// A source of [Buffer]s that can take them back.
pub trait Pool: Clone + Send + Sync + 'static {
    /// Return a buffer to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` was not issued by this pool.
    fn release(&self, buffer: Buffer);

    /// Number of bytes currently checked out of the pool.
    fn total_size(&self) -> usize;
}

/// Create a [std::num::NonZeroUsize] from a constant expression, panicking (at compile time
/// when used in a `const` context) if it is zero.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match ::std::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}
