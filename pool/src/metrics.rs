//! Metrics exported by each pool.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Label for size-classed pool metrics, identifying the size class.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct SizeClassLabel {
    pub(crate) size_class: u64,
}

impl SizeClassLabel {
    pub(crate) fn new(size_class: usize) -> Self {
        Self {
            size_class: size_class as u64,
        }
    }
}

/// Metrics for a [crate::DynamicPool].
pub(crate) struct DynamicMetrics {
    /// Number of buffers currently allocated (out of pool).
    pub(crate) allocated: Family<SizeClassLabel, Gauge>,
    /// Number of buffers available in each free list.
    pub(crate) available: Family<SizeClassLabel, Gauge>,
    /// Total number of allocations served by a size class.
    pub(crate) allocations_total: Family<SizeClassLabel, Counter>,
    /// Total number of allocations served directly from the heap.
    pub(crate) oversized_total: Counter,
    /// Bytes currently checked out.
    pub(crate) total_size: Gauge,
}

impl DynamicMetrics {
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Family::default(),
            available: Family::default(),
            allocations_total: Family::default(),
            oversized_total: Counter::default(),
            total_size: Gauge::default(),
        };

        registry.register(
            "buffer_pool_allocated",
            "Number of buffers currently allocated from the pool",
            metrics.allocated.clone(),
        );
        registry.register(
            "buffer_pool_available",
            "Number of buffers available in the pool",
            metrics.available.clone(),
        );
        registry.register(
            "buffer_pool_allocations",
            "Total number of buffer allocations served by a size class",
            metrics.allocations_total.clone(),
        );
        registry.register(
            "buffer_pool_oversized",
            "Total number of allocations larger than every size class",
            metrics.oversized_total.clone(),
        );
        registry.register(
            "buffer_pool_total_size",
            "Bytes currently checked out of the pool",
            metrics.total_size.clone(),
        );

        metrics
    }
}

/// Metrics for a [crate::FixedPool].
pub(crate) struct FixedMetrics {
    /// Number of buffers currently allocated (out of pool).
    pub(crate) allocated: Gauge,
    /// Number of buffers available in the free list.
    pub(crate) available: Gauge,
    /// Number of requesters waiting for a buffer.
    pub(crate) waiting: Gauge,
    /// Bytes currently checked out.
    pub(crate) total_size: Gauge,
    /// Total number of allocations served from the free list.
    pub(crate) allocations_total: Counter,
    /// Total number of allocation attempts that found the pool exhausted.
    pub(crate) exhausted_total: Counter,
    /// Total number of released buffers handed directly to a waiter.
    pub(crate) handoffs_total: Counter,
    /// Total number of deliveries refused by their target.
    pub(crate) refused_total: Counter,
}

impl FixedMetrics {
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Gauge::default(),
            available: Gauge::default(),
            waiting: Gauge::default(),
            total_size: Gauge::default(),
            allocations_total: Counter::default(),
            exhausted_total: Counter::default(),
            handoffs_total: Counter::default(),
            refused_total: Counter::default(),
        };

        registry.register(
            "buffer_pool_allocated",
            "Number of buffers currently allocated from the pool",
            metrics.allocated.clone(),
        );
        registry.register(
            "buffer_pool_available",
            "Number of buffers available in the pool",
            metrics.available.clone(),
        );
        registry.register(
            "buffer_pool_waiting",
            "Number of requesters waiting for a buffer",
            metrics.waiting.clone(),
        );
        registry.register(
            "buffer_pool_total_size",
            "Bytes currently checked out of the pool",
            metrics.total_size.clone(),
        );
        registry.register(
            "buffer_pool_allocations",
            "Total number of buffer allocations served from the free list",
            metrics.allocations_total.clone(),
        );
        registry.register(
            "buffer_pool_exhausted",
            "Total number of allocation attempts that found the pool exhausted",
            metrics.exhausted_total.clone(),
        );
        registry.register(
            "buffer_pool_handoffs",
            "Total number of released buffers handed directly to a waiter",
            metrics.handoffs_total.clone(),
        );
        registry.register(
            "buffer_pool_refused",
            "Total number of buffer deliveries refused by their target",
            metrics.refused_total.clone(),
        );

        metrics
    }
}
