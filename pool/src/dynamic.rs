//! A pool of buffers organized into an ordered ladder of size classes.
//!
//! # Size Classes
//!
//! Each class has its own free list of reclaimed blocks, served in stack order (the most
//! recently released block is reused first). For example, with classes `[4, 8, 16, 32]`:
//! - A request for 10 bytes is served from the 16 byte class.
//! - A request for 32 bytes is served from the 32 byte class.
//! - A request for 100 bytes is larger than every class and is carved directly from the
//!   heap (and freed directly on release).
//!
//! When a class's free list is empty, a fresh block of the class size is carved from the heap.
//! Allocation therefore never fails (heap exhaustion aborts the process).
//!
//! # Accounting
//!
//! `total_size` tracks the bytes currently checked out: the class size for class-backed
//! buffers and the requested size for oversized ones.

use crate::{
    block::{cache_line_size, RawBlock},
    buffer::{Header, Reclaim},
    guard::CriticalSection,
    metrics::{DynamicMetrics, SizeClassLabel},
    Buffer, Error, Notify, Pool,
};
use prometheus_client::registry::Registry;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Weak},
};
use tracing::{debug, trace};

/// Configuration for a [DynamicPool].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size classes, in strictly increasing order.
    pub classes: Vec<NonZeroUsize>,
    /// Block alignment. Must be a power of two.
    pub alignment: NonZeroUsize,
}

impl Default for Config {
    /// The ladder used for general message buffers: `[4, 8, 16, 32]`, cache-line aligned.
    fn default() -> Self {
        Self {
            classes: vec![
                crate::NZUsize!(4),
                crate::NZUsize!(8),
                crate::NZUsize!(16),
                crate::NZUsize!(32),
            ],
            alignment: crate::NZUsize!(cache_line_size()),
        }
    }
}

impl Config {
    /// Builds a cache-line aligned configuration from a zero-terminated ladder of class sizes.
    ///
    /// Sizes after the first zero are ignored. A ladder without a zero is read in full.
    pub fn from_ladder(ladder: &[usize]) -> Self {
        let classes = ladder
            .iter()
            .map_while(|&size| NonZeroUsize::new(size))
            .collect();
        Self {
            classes,
            alignment: crate::NZUsize!(cache_line_size()),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// - no size classes
    /// - size classes not strictly increasing
    /// - `alignment` not a power of two
    pub fn validate(&self) -> Result<(), Error> {
        if self.classes.is_empty() {
            return Err(Error::InvalidConfig("at least one size class is required"));
        }
        if self.classes.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::InvalidConfig(
                "size classes must be strictly increasing",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfig("alignment must be a power of two"));
        }
        Ok(())
    }

    /// Returns the index of the smallest class that can hold `size` bytes.
    ///
    /// Returns `None` if `size` is larger than every class.
    fn class_index(&self, size: usize) -> Option<usize> {
        // Classes are strictly increasing, so the first fit is the smallest.
        self.classes.iter().position(|class| size <= class.get())
    }
}

/// Mutable pool state, only touched inside the critical section.
struct State {
    /// One free list per size class (stack ordered).
    free: Vec<Vec<RawBlock>>,
    /// Bytes currently checked out.
    total_size: usize,
}

/// Internal state of the size-classed pool.
struct Inner {
    config: Config,
    state: CriticalSection<State>,
    metrics: DynamicMetrics,
    /// Handle to ourselves, stamped into every issued [Header].
    me: Weak<Inner>,
}

impl Inner {
    fn alloc(&self, size: usize) -> Buffer {
        let block = match self.config.class_index(size) {
            Some(index) => {
                let class_size = self.config.classes[index].get();
                let label = SizeClassLabel::new(class_size);
                let recycled = {
                    let mut state = self.state.enter();
                    let recycled = state.free[index].pop();
                    state.total_size = state
                        .total_size
                        .checked_add(class_size)
                        .expect("checked-out bytes overflow usize");
                    self.metrics.total_size.set(state.total_size as i64);
                    self.metrics.allocated.get_or_create(&label).inc();
                    self.metrics.allocations_total.get_or_create(&label).inc();
                    if recycled.is_some() {
                        self.metrics.available.get_or_create(&label).dec();
                    }
                    recycled
                };
                recycled.unwrap_or_else(|| RawBlock::new(class_size, self.config.alignment.get()))
            }
            None => {
                debug!(size, "allocating oversized buffer");
                // Carve first so a fatal layout never leaves the count inflated
                let block = RawBlock::new(size, self.config.alignment.get());
                let mut state = self.state.enter();
                state.total_size = state
                    .total_size
                    .checked_add(size)
                    .expect("checked-out bytes overflow usize");
                self.metrics.total_size.set(state.total_size as i64);
                self.metrics.oversized_total.inc();
                block
            }
        };

        let owner: Weak<dyn Reclaim> = self.me.clone();
        Buffer::new(Header::new(size, owner), block)
    }
}

impl Reclaim for Inner {
    fn reclaim(&self, size: usize, block: RawBlock) {
        // Membership is determined by the recorded size, which selects the same
        // class the block was drawn from.
        match self.config.class_index(size) {
            Some(index) => {
                let class_size = self.config.classes[index].get();
                debug_assert!(block.capacity() >= class_size);
                let label = SizeClassLabel::new(class_size);

                let mut state = self.state.enter();
                state.free[index].push(block);
                state.total_size -= class_size;
                self.metrics.total_size.set(state.total_size as i64);
                self.metrics.allocated.get_or_create(&label).dec();
                self.metrics.available.get_or_create(&label).inc();
            }
            None => {
                {
                    let mut state = self.state.enter();
                    state.total_size -= size;
                    self.metrics.total_size.set(state.total_size as i64);
                }
                // Oversized blocks go straight back to the heap
                drop(block);
            }
        }
    }
}

/// A pool of buffers organized into an ordered ladder of size classes.
///
/// Requests are served from the smallest class that fits, recycling a previously released
/// block when one is available. Requests larger than every class fall back to the heap.
#[derive(Clone)]
pub struct DynamicPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DynamicPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPool")
            .field("config", &self.inner.config)
            .field("total_size", &self.total_size())
            .finish()
    }
}

impl DynamicPool {
    /// Creates a new pool with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(config: Config, registry: &mut Registry) -> Self {
        if let Err(err) = config.validate() {
            panic!("{err}");
        }
        debug!(classes = ?config.classes, "creating size-classed pool");

        let metrics = DynamicMetrics::new(registry);
        let free = config.classes.iter().map(|_| Vec::new()).collect();
        let inner = Arc::new_cyclic(|me| Inner {
            config,
            state: CriticalSection::new(State {
                free,
                total_size: 0,
            }),
            metrics,
            me: me.clone(),
        });
        Self { inner }
    }

    /// Allocates a buffer with a payload of `size` bytes.
    ///
    /// The buffer is drawn from the smallest size class with a class size of at least `size`
    /// (recycled if that class has a released block, freshly carved otherwise), or carved
    /// directly from the heap if no class is large enough.
    pub fn alloc(&self, size: usize) -> Buffer {
        self.inner.alloc(size)
    }

    /// Allocates a buffer with a payload of `size` bytes and delivers it to `target` before
    /// returning.
    ///
    /// If `target` refuses the buffer, it is returned to the pool.
    pub fn alloc_async<N: Notify>(&self, size: usize, target: N) {
        let buffer = self.inner.alloc(size);
        if let Err(buffer) = Box::new(target).deliver(buffer) {
            trace!(size, "delivery refused");
            drop(buffer);
        }
    }

    /// Returns the configured size classes.
    pub fn classes(&self) -> &[NonZeroUsize] {
        &self.inner.config.classes
    }

    /// Returns the number of released blocks waiting in the free list of `class_size`.
    ///
    /// Returns `None` if `class_size` is not one of the configured classes.
    pub fn available(&self, class_size: usize) -> Option<usize> {
        let index = self
            .inner
            .config
            .classes
            .iter()
            .position(|class| class.get() == class_size)?;
        Some(self.inner.state.enter().free[index].len())
    }
}

impl Pool for DynamicPool {
    /// Returns `buffer` to the free list of the class matching its recorded size, or frees it if
    /// it is oversized.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` was issued by a different pool.
    fn release(&self, buffer: Buffer) {
        assert!(
            buffer.is_owned_by(&self.inner),
            "buffer released to a pool that did not issue it"
        );
        let (size, block) = buffer.into_parts();
        self.inner.reclaim(size, block);
    }

    fn total_size(&self) -> usize {
        self.inner.state.enter().total_size
    }
}
