//! A pool of equally sized buffers with FIFO hand-off to waiting requesters.
//!
//! # Exhaustion
//!
//! A [FixedPool] owns a bounded number of blocks, all carved when the pool is created. Once
//! they are all checked out, the pool is exhausted:
//! - [FixedPool::try_alloc] returns `None` (and registers nothing).
//! - [FixedPool::alloc_async] queues its [Notify] target on the wait list.
//!
//! # Hand-off
//!
//! While requesters are waiting, a released block bypasses the free list and is delivered
//! directly to the oldest waiter. Waiters are therefore served strictly in registration order,
//! and a synchronous caller keeps observing exhaustion until more blocks are released than
//! there are waiters.
//!
//! ```text
//!              alloc empties free list
//!   Available ------------------------> Exhausted
//!       ^                                 |   ^
//!       |  release with no waiter left    |   | release serves a waiter,
//!       +---------------------------------+   | others remain queued
//!                                             +---+
//! ```

use crate::{
    block::{cache_line_size, RawBlock},
    buffer::{Header, Reclaim},
    guard::CriticalSection,
    metrics::FixedMetrics,
    Buffer, Error, Notify, Pool,
};
use futures::channel::oneshot;
use prometheus_client::registry::Registry;
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};
use tracing::{debug, trace, warn};

/// Configuration for a [FixedPool].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size of every block in the pool.
    pub item_size: NonZeroUsize,
    /// Number of blocks owned by the pool.
    pub items: NonZeroUsize,
    /// Block alignment. Must be a power of two.
    pub alignment: NonZeroUsize,
}

impl Config {
    /// Creates a cache-line aligned configuration of `items` blocks of `item_size` bytes.
    pub const fn new(item_size: NonZeroUsize, items: NonZeroUsize) -> Self {
        Self {
            item_size,
            items,
            alignment: crate::NZUsize!(cache_line_size()),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// - `alignment` not a power of two
    pub fn validate(&self) -> Result<(), Error> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfig("alignment must be a power of two"));
        }
        Ok(())
    }
}

/// Outcome of [FixedPool::alloc_async].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A buffer was available and has already been delivered to the target.
    Immediate,
    /// The pool was exhausted. The target was queued and will receive the next released buffer
    /// that is not claimed by an earlier waiter.
    Pending,
}

/// Mutable pool state, only touched inside the critical section.
struct State {
    /// Reclaimed blocks (stack ordered).
    free: Vec<RawBlock>,
    /// Set once an allocation empties (or finds empty) the free list, cleared once a release
    /// leaves no waiter behind.
    empty: bool,
    /// Requesters waiting for a buffer, oldest first.
    waiters: VecDeque<Box<dyn Notify>>,
    /// Bytes currently checked out.
    total_size: usize,
}

/// Internal state of the fixed-size pool.
struct Inner {
    config: Config,
    state: CriticalSection<State>,
    metrics: FixedMetrics,
    /// Handle to ourselves, stamped into every issued [Header].
    me: Weak<Inner>,
}

impl Inner {
    fn issue(&self, block: RawBlock) -> Buffer {
        let owner: Weak<dyn Reclaim> = self.me.clone();
        Buffer::new(Header::new(self.config.item_size.get(), owner), block)
    }

    /// Pops a block from the free list, or marks the pool exhausted (queueing `target` if
    /// provided).
    ///
    /// A popped block is returned along with `target` so that delivery happens outside the
    /// critical section.
    fn take(&self, target: Option<Box<dyn Notify>>) -> Take {
        let item_size = self.config.item_size.get();
        let mut state = self.state.enter();
        if let Some(block) = state.free.pop() {
            if state.free.is_empty() {
                state.empty = true;
            }
            state.total_size += item_size;
            self.metrics.total_size.set(state.total_size as i64);
            self.metrics.allocations_total.inc();
            self.metrics.allocated.inc();
            self.metrics.available.dec();
            return Take::Block(block, target);
        }

        state.empty = true;
        self.metrics.exhausted_total.inc();
        match target {
            Some(target) => {
                state.waiters.retain(|waiter| !waiter.is_abandoned());
                state.waiters.push_back(target);
                self.metrics.waiting.set(state.waiters.len() as i64);
                Take::Queued
            }
            None => Take::Exhausted,
        }
    }
}

/// Result of [Inner::take].
enum Take {
    Block(RawBlock, Option<Box<dyn Notify>>),
    Queued,
    Exhausted,
}

impl Inner {
    /// Decides where a released block goes.
    ///
    /// With no one waiting, the block returns to the free list. Otherwise it is claimed for the
    /// oldest waiter, unless a hand-off for this pool is already being delivered on this thread,
    /// in which case the block is deferred to that hand-off.
    fn route(&self, block: RawBlock, nested: bool) -> Route {
        let mut state = self.state.enter();
        if !state.empty || state.waiters.is_empty() {
            // Exhaustion seen only by synchronous callers has no one to hand off to
            state.empty = false;
            state.free.push(block);
            state.total_size -= self.config.item_size.get();
            self.metrics.total_size.set(state.total_size as i64);
            self.metrics.allocated.dec();
            self.metrics.available.inc();
            return Route::Restocked;
        }
        if nested {
            let key = self.key();
            HANDOFFS.with_borrow_mut(|active| {
                if let Some((_, deferred)) = active.iter_mut().find(|(pool, _)| *pool == key) {
                    deferred.push(block);
                }
            });
            return Route::Deferred;
        }

        let Some(waiter) = state.waiters.pop_front() else {
            unreachable!("wait list checked above");
        };
        if state.waiters.is_empty() {
            state.empty = false;
        }
        self.metrics.waiting.set(state.waiters.len() as i64);
        self.metrics.handoffs_total.inc();
        Route::Handoff(waiter, block)
    }

    /// Routes `block` from the active hand-off loop, returning the next delivery to make.
    fn claim(&self, block: RawBlock) -> Option<(Box<dyn Notify>, RawBlock)> {
        match self.route(block, false) {
            Route::Handoff(waiter, block) => Some((waiter, block)),
            Route::Restocked | Route::Deferred => None,
        }
    }

    /// Identifies this pool in [HANDOFFS].
    fn key(&self) -> usize {
        self as *const Self as usize
    }
}

/// Result of [Inner::route].
enum Route {
    Restocked,
    Deferred,
    Handoff(Box<dyn Notify>, RawBlock),
}

thread_local! {
    /// Pools with a hand-off being delivered on this thread, with the blocks released to them
    /// from within that delivery.
    static HANDOFFS: RefCell<Vec<(usize, Vec<RawBlock>)>> = const { RefCell::new(Vec::new()) };
}

/// Marks a hand-off in progress for one pool on this thread.
struct Delivering<'a> {
    pool: &'a Inner,
}

impl<'a> Delivering<'a> {
    fn enter(pool: &'a Inner) -> Self {
        let key = pool.key();
        HANDOFFS.with_borrow_mut(|active| active.push((key, Vec::new())));
        Self { pool }
    }

    fn is_active(pool: &Inner) -> bool {
        let key = pool.key();
        HANDOFFS.with_borrow(|active| active.iter().any(|(active, _)| *active == key))
    }

    /// Takes the next block released to the pool during delivery.
    fn next(&self) -> Option<RawBlock> {
        let key = self.pool.key();
        HANDOFFS.with_borrow_mut(|active| {
            active
                .iter_mut()
                .find(|(pool, _)| *pool == key)
                .and_then(|(_, deferred)| deferred.pop())
        })
    }
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        let key = self.pool.key();
        let deferred = HANDOFFS.with_borrow_mut(|active| {
            active
                .iter()
                .position(|(pool, _)| *pool == key)
                .map(|index| active.remove(index).1)
                .unwrap_or_default()
        });

        // Only non-empty if a delivery panicked
        if !deferred.is_empty() {
            let mut state = self.pool.state.enter();
            for block in deferred {
                state.free.push(block);
                state.total_size -= self.pool.config.item_size.get();
                self.pool.metrics.allocated.dec();
                self.pool.metrics.available.inc();
            }
            self.pool.metrics.total_size.set(state.total_size as i64);
        }
    }
}

impl Reclaim for Inner {
    fn reclaim(&self, size: usize, block: RawBlock) {
        let item_size = self.config.item_size.get();
        assert!(
            size <= item_size,
            "released buffer ({size}) larger than pool item size ({item_size})"
        );

        let Route::Handoff(waiter, block) = self.route(block, Delivering::is_active(self)) else {
            return;
        };

        // Releases made from within a delivery are served by this loop rather than recursing,
        // so stack depth stays flat however many waiters release synchronously.
        let delivering = Delivering::enter(self);
        let mut next = Some((waiter, block));
        while let Some((waiter, block)) = next.take() {
            // Deliver outside the critical section: the waiter may re-enter the pool.
            trace!("handing off released buffer");
            if let Err(refused) = waiter.deliver(self.issue(block)) {
                warn!("waiter refused buffer, releasing again");
                self.metrics.refused_total.inc();
                let (_, block) = refused.into_parts();
                next = self.claim(block);
            }
            while next.is_none() {
                let Some(block) = delivering.next() else {
                    break;
                };
                next = self.claim(block);
            }
        }
    }
}

/// A pool of equally sized buffers.
///
/// Exhaustion is reported synchronously by [FixedPool::try_alloc] or resolved later by queueing
/// a [Notify] target with [FixedPool::alloc_async] (or awaiting [FixedPool::acquire]).
#[derive(Clone)]
pub struct FixedPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FixedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPool")
            .field("config", &self.inner.config)
            .field("available", &self.available())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl FixedPool {
    /// Creates a new pool, carving all `items` blocks up front.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(config: Config, registry: &mut Registry) -> Self {
        if let Err(err) = config.validate() {
            panic!("{err}");
        }
        debug!(
            item_size = config.item_size.get(),
            items = config.items.get(),
            "creating fixed pool"
        );

        let metrics = FixedMetrics::new(registry);
        let free: Vec<_> = (0..config.items.get())
            .map(|_| RawBlock::new(config.item_size.get(), config.alignment.get()))
            .collect();
        metrics.available.set(free.len() as i64);
        let inner = Arc::new_cyclic(|me| Inner {
            config,
            state: CriticalSection::new(State {
                free,
                empty: false,
                waiters: VecDeque::new(),
                total_size: 0,
            }),
            metrics,
            me: me.clone(),
        });
        Self { inner }
    }

    /// Attempts to allocate a buffer without waiting.
    ///
    /// Returns `None` if the pool is exhausted. Nothing is registered, so the caller must retry
    /// later (or use [FixedPool::alloc_async]).
    pub fn try_alloc(&self) -> Option<Buffer> {
        match self.inner.take(None) {
            Take::Block(block, _) => Some(self.inner.issue(block)),
            Take::Queued | Take::Exhausted => None,
        }
    }

    /// Allocates a buffer for `target`.
    ///
    /// If a buffer is available, it is delivered to `target` before returning
    /// ([Allocation::Immediate]). Otherwise `target` is queued and receives a buffer when one is
    /// released ([Allocation::Pending]).
    ///
    /// A queued target is never cancelled by the pool. If it can no longer accept a buffer when
    /// one arrives, it must refuse delivery (see [Notify::deliver]).
    pub fn alloc_async<N: Notify>(&self, target: N) -> Allocation {
        match self.inner.take(Some(Box::new(target))) {
            Take::Block(block, Some(target)) => {
                if let Err(refused) = target.deliver(self.inner.issue(block)) {
                    self.inner.metrics.refused_total.inc();
                    drop(refused);
                }
                Allocation::Immediate
            }
            Take::Queued => Allocation::Pending,
            Take::Block(_, None) | Take::Exhausted => {
                unreachable!("target provided")
            }
        }
    }

    /// Returns a future that resolves to the next buffer available to this requester.
    ///
    /// Dropping the future before it resolves withdraws the request: a buffer later handed to it
    /// is released again.
    pub fn acquire(&self) -> Acquire {
        let (tx, rx) = oneshot::channel();
        self.alloc_async(tx);
        Acquire { receiver: rx }
    }

    /// Returns the size of every buffer in the pool.
    pub fn item_size(&self) -> usize {
        self.inner.config.item_size.get()
    }

    /// Returns the number of blocks in the free list.
    pub fn available(&self) -> usize {
        self.inner.state.enter().free.len()
    }

    /// Returns the number of requesters waiting for a buffer.
    ///
    /// Requesters known to have abandoned their request are discarded first.
    pub fn waiting(&self) -> usize {
        let mut state = self.inner.state.enter();
        state.waiters.retain(|waiter| !waiter.is_abandoned());
        self.inner.metrics.waiting.set(state.waiters.len() as i64);
        state.waiters.len()
    }

    /// Returns `true` if the pool has been observed exhausted and no release has cleared it.
    pub fn is_exhausted(&self) -> bool {
        self.inner.state.enter().empty
    }
}

impl Pool for FixedPool {
    /// Returns `buffer` to the pool, handing it to the oldest waiter if there is one.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` was issued by a different pool or is larger than the pool's item size.
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

/// Future returned by [FixedPool::acquire].
#[must_use = "futures do nothing unless polled"]
pub struct Acquire {
    receiver: oneshot::Receiver<Buffer>,
}

impl Future for Acquire {
    type Output = Result<Buffer, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map_err(|_| Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Callback;
    use futures::{executor::block_on, FutureExt};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        thread,
    };

    fn test_pool(item_size: usize, items: usize) -> FixedPool {
        FixedPool::new(
            Config::new(
                NonZeroUsize::new(item_size).unwrap(),
                NonZeroUsize::new(items).unwrap(),
            ),
            &mut Registry::default(),
        )
    }

    /// A callback that records `id` and keeps the buffer it receives.
    fn recorder(
        id: usize,
        log: &Arc<Mutex<Vec<(usize, Buffer)>>>,
    ) -> Callback<impl FnOnce(Buffer) + Send + 'static> {
        let log = log.clone();
        Callback(move |buffer: Buffer| log.lock().unwrap().push((id, buffer)))
    }

    #[test]
    fn test_config_validation() {
        let config = Config {
            alignment: crate::NZUsize!(6),
            ..Config::new(crate::NZUsize!(8), crate::NZUsize!(1))
        };
        assert_eq!(
            config.validate(),
            Err(Error::InvalidConfig("alignment must be a power of two"))
        );
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = test_pool(32, 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.item_size(), 32);

        let a = pool.try_alloc().expect("first alloc should succeed");
        let b = pool.try_alloc().expect("second alloc should succeed");
        assert_eq!(a.size(), 32);
        assert_eq!(b.capacity(), 32);
        assert_eq!(pool.total_size(), 64);

        // Taking the last block latches exhaustion
        assert!(pool.is_exhausted());
        assert!(pool.try_alloc().is_none());
        assert!(pool.is_exhausted());
        assert_eq!(pool.waiting(), 0);
    }

    #[test]
    fn test_waiters_served_fifo_scenario() {
        let pool = test_pool(32, 2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert!(pool.is_exhausted());

        assert_eq!(pool.alloc_async(recorder(1, &log)), Allocation::Pending);
        assert_eq!(pool.alloc_async(recorder(2, &log)), Allocation::Pending);
        assert_eq!(pool.waiting(), 2);

        // First release goes straight to the first waiter
        let a_ptr = a.as_ptr();
        pool.release(a);
        {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].0, 1);
            assert_eq!(log[0].1.as_ptr(), a_ptr);
        }
        assert!(pool.is_exhausted());
        assert_eq!(pool.waiting(), 1);
        assert_eq!(pool.available(), 0);

        // Second release serves the second waiter and clears exhaustion
        pool.release(b);
        assert_eq!(log.lock().unwrap()[1].0, 2);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.waiting(), 0);
        assert_eq!(pool.available(), 0);

        // Both buffers are still checked out (by the waiters)
        assert_eq!(pool.total_size(), 64);
        log.lock().unwrap().clear();
        assert_eq!(pool.total_size(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_fifo_many_waiters() {
        let pool = test_pool(8, 3);
        let order = Arc::new(Mutex::new(Vec::new()));
        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        let held: Vec<_> = (0..3).map(|_| pool.try_alloc().unwrap()).collect();

        for id in 0..10 {
            let target = Callback({
                let order = order.clone();
                let inbox = inbox.clone();
                move |buffer: Buffer| {
                    order.lock().unwrap().push(id);
                    inbox.lock().unwrap().push_back(buffer);
                }
            });
            assert_eq!(pool.alloc_async(target), Allocation::Pending);
        }

        // Release the held buffers, then recycle each delivered buffer in turn
        for buffer in held {
            pool.release(buffer);
        }
        loop {
            let next = inbox.lock().unwrap().pop_front();
            let Some(buffer) = next else { break };
            pool.release(buffer);
        }

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(pool.waiting(), 0);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.total_size(), 0);
    }

    #[test]
    fn test_handoff_bypasses_free_list() {
        let pool = test_pool(16, 1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let held = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
        pool.alloc_async(recorder(0, &log));

        pool.release(held);
        assert_eq!(log.lock().unwrap().len(), 1);

        // A synchronous caller still sees exhaustion
        assert_eq!(pool.available(), 0);
        assert!(pool.try_alloc().is_none());
    }

    #[test]
    fn test_exhausted_try_alloc_is_idempotent() {
        let pool = test_pool(4, 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let held = pool.try_alloc().unwrap();
        pool.alloc_async(recorder(0, &log));

        for _ in 0..5 {
            assert!(pool.try_alloc().is_none());
            assert_eq!(pool.waiting(), 1);
            assert!(pool.is_exhausted());
        }
        drop(held);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_release_without_waiters_clears_exhaustion() {
        let pool = test_pool(4, 1);
        let held = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
        assert!(pool.is_exhausted());

        // No one is waiting, so the block goes back on the free list
        pool.release(held);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.available(), 1);
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn test_alloc_async_immediate() {
        let pool = test_pool(8, 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        assert_eq!(pool.alloc_async(recorder(7, &log)), Allocation::Immediate);
        assert_eq!(log.lock().unwrap()[0].0, 7);
        assert_eq!(pool.total_size(), 8);
        assert_eq!(pool.waiting(), 0);
    }

    #[test]
    fn test_delivery_may_reenter_pool() {
        let pool = test_pool(8, 1);
        let held = pool.try_alloc().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        pool.alloc_async(Callback({
            let pool = pool.clone();
            let calls = calls.clone();
            move |buffer: Buffer| {
                calls.fetch_add(1, Ordering::SeqCst);
                // Releasing from within the delivery must not deadlock
                pool.release(buffer);
                assert!(pool.try_alloc().is_some());
            }
        }));

        pool.release(held);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total_size(), 0);
    }

    #[test]
    fn test_self_releasing_waiters_served_iteratively() {
        const WAITERS: usize = 10_000;
        let pool = test_pool(8, 1);
        let order = Arc::new(Mutex::new(Vec::with_capacity(WAITERS)));
        let held = pool.try_alloc().unwrap();
        for id in 0..WAITERS {
            let target = Callback({
                let pool = pool.clone();
                let order = order.clone();
                move |buffer: Buffer| {
                    order.lock().unwrap().push(id);
                    pool.release(buffer);
                }
            });
            assert_eq!(pool.alloc_async(target), Allocation::Pending);
        }

        // Every waiter releases from within its delivery
        pool.release(held);
        assert_eq!(*order.lock().unwrap(), (0..WAITERS).collect::<Vec<_>>());
        assert_eq!(pool.waiting(), 0);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total_size(), 0);
    }

    #[test]
    fn test_nested_release_to_other_pool() {
        let first = test_pool(8, 1);
        let second = test_pool(8, 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let held_first = first.try_alloc().unwrap();
        let held_second = second.try_alloc().unwrap();
        second.alloc_async(recorder(2, &log));

        // Delivery from the first pool releases into the second
        let handed = Arc::new(Mutex::new(Some(held_second)));
        first.alloc_async(Callback({
            let second = second.clone();
            let handed = handed.clone();
            move |buffer: Buffer| {
                second.release(handed.lock().unwrap().take().unwrap());
                drop(buffer);
            }
        }));
        first.release(held_first);

        assert_eq!(log.lock().unwrap()[0].0, 2);
        assert_eq!(first.available(), 1);
        assert_eq!(second.waiting(), 0);
    }

    #[test]
    fn test_abandoned_waiters_pruned() {
        let pool = test_pool(8, 1);
        let held = pool.try_alloc().unwrap();
        for _ in 0..10_000 {
            drop(pool.acquire());
        }
        assert_eq!(pool.waiting(), 0);

        let pending = pool.acquire();
        assert_eq!(pool.waiting(), 1);
        drop(held);
        assert_eq!(block_on(pending).unwrap().size(), 8);
        assert_eq!(pool.waiting(), 0);
    }

    #[test]
    fn test_refused_delivery_serves_next_waiter() {
        let pool = test_pool(8, 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let held = pool.try_alloc().unwrap();

        // An abandoned requester followed by a live one
        let (tx, rx) = oneshot::channel();
        assert_eq!(pool.alloc_async(tx), Allocation::Pending);
        pool.alloc_async(recorder(1, &log));
        drop(rx);

        pool.release(held);
        assert_eq!(log.lock().unwrap()[0].0, 1);
        assert_eq!(pool.waiting(), 0);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.total_size(), 8);
    }

    #[test]
    fn test_refused_delivery_without_waiters_returns_to_free_list() {
        let pool = test_pool(8, 1);
        let held = pool.try_alloc().unwrap();
        let (tx, rx) = oneshot::channel();
        pool.alloc_async(tx);
        drop(rx);

        pool.release(held);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total_size(), 0);
        assert!(!pool.is_exhausted());
    }

    #[test]
    fn test_acquire_immediate_and_pending() {
        let pool = test_pool(8, 1);
        let first = block_on(pool.acquire()).unwrap();

        let mut pending = pool.acquire();
        assert!((&mut pending).now_or_never().is_none());
        assert_eq!(pool.waiting(), 1);

        let ptr = first.as_ptr();
        drop(first);
        let second = block_on(pending).unwrap();
        assert_eq!(second.as_ptr(), ptr);
    }

    #[test]
    fn test_dropped_acquire_is_withdrawn() {
        let pool = test_pool(8, 1);
        let held = pool.try_alloc().unwrap();
        let abandoned = pool.acquire();
        let waiting = pool.acquire();
        drop(abandoned);

        drop(held);
        let buffer = block_on(waiting).unwrap();
        assert_eq!(buffer.size(), 8);
        assert_eq!(pool.waiting(), 0);
    }

    #[test]
    fn test_acquire_closed_when_pool_dropped() {
        let pool = test_pool(8, 1);
        let _held = pool.try_alloc().unwrap();
        let pending = pool.acquire();
        drop(pool);
        assert_eq!(block_on(pending).unwrap_err(), Error::Closed);
    }

    #[test]
    #[should_panic(expected = "buffer released to a pool that did not issue it")]
    fn test_release_to_wrong_pool() {
        let first = test_pool(8, 1);
        let second = test_pool(8, 1);
        second.release(first.try_alloc().unwrap());
    }

    #[test]
    #[should_panic(expected = "larger than pool item size")]
    fn test_reclaim_oversized_panics() {
        let pool = test_pool(8, 1);
        pool.inner.reclaim(9, RawBlock::new(9, 8));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = test_pool(16, 2);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let buffer = block_on(pool.acquire()).unwrap();
                        assert_eq!(buffer.size(), 16);
                        drop(buffer);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.total_size(), 0);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.waiting(), 0);
    }

    #[test]
    fn test_metrics_encoded() {
        let mut registry = Registry::default();
        let pool = FixedPool::new(
            Config::new(crate::NZUsize!(32), crate::NZUsize!(1)),
            &mut registry,
        );
        let held = pool.try_alloc().unwrap();
        let pending = pool.acquire();
        drop(held);
        drop(block_on(pending).unwrap());

        let mut encoded = String::new();
        prometheus_client::encoding::text::encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("buffer_pool_handoffs_total 1"));
        assert!(encoded.contains("buffer_pool_exhausted_total 1"));
        assert!(encoded.contains("buffer_pool_available 1"));
        assert!(encoded.contains("buffer_pool_total_size 0"));
    }
}
