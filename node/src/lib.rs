//! Drive message buffer pools from concurrent workers under a liveness watchdog.
//!
//! [run] is the one place the process-wide pools are built: a size-classed pool for variable
//! payloads and a fixed pool of message slots. Each worker repeatedly acquires a slot (queuing
//! behind other workers when the fixed pool is exhausted), stages a payload from the size-classed
//! pool, copies it into the slot, and releases both. Every completed message resets the watchdog.

use bufq_pool::{DynamicConfig, DynamicPool, FixedConfig, FixedPool, Pool};
use bufq_watchdog::{Config as WatchdogConfig, Handle, Watchdog};
use prometheus_client::registry::Registry;
use std::{num::NonZeroUsize, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur when running the node.
#[derive(Error, Debug)]
pub enum Error {
    #[error("pool error: {0}")]
    Pool(#[from] bufq_pool::Error),
    #[error("watchdog error: {0}")]
    Watchdog(#[from] bufq_watchdog::Error),
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Configuration for [run].
#[derive(Clone, Debug)]
pub struct Config {
    /// Size classes of the size-classed pool.
    pub dynamic: DynamicConfig,
    /// Shape of the fixed pool of message slots.
    pub fixed: FixedConfig,
    /// Number of concurrent workers.
    pub workers: NonZeroUsize,
    /// Messages processed by each worker.
    pub messages: usize,
    /// Watchdog period.
    pub watchdog: WatchdogConfig,
    /// Period of the watchdog's automatic reset.
    ///
    /// Should be shorter than the watchdog period.
    pub reset_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dynamic: DynamicConfig::default(),
            fixed: FixedConfig::new(bufq_pool::NZUsize!(64), bufq_pool::NZUsize!(4)),
            workers: bufq_pool::NZUsize!(8),
            messages: 1_000,
            watchdog: WatchdogConfig::default(),
            reset_period: Duration::from_millis(250),
        }
    }
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        self.dynamic.validate()?;
        self.fixed.validate()?;
        if self.reset_period >= self.watchdog.period {
            return Err(Error::InvalidArgument(
                "reset period must be shorter than the watchdog period",
            ));
        }
        Ok(())
    }
}

/// Summary of a completed [run].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    /// Messages processed across all workers.
    pub messages: usize,
    /// Bytes still checked out of the size-classed pool.
    pub dynamic_total_size: usize,
    /// Bytes still checked out of the fixed pool.
    pub fixed_total_size: usize,
    /// Slots in the fixed pool's free list.
    pub fixed_available: usize,
}

/// Build the pools, start the watchdog, and run every worker to completion.
///
/// Pool metrics are registered under the `dynamic` and `fixed` prefixes of `registry`.
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub async fn run(cfg: Config, registry: &mut Registry) -> Result<Report, Error> {
    cfg.validate()?;
    let dynamic = DynamicPool::new(cfg.dynamic, registry.sub_registry_with_prefix("dynamic"));
    let fixed = FixedPool::new(cfg.fixed, registry.sub_registry_with_prefix("fixed"));

    let mut watchdog = Watchdog::start(cfg.watchdog)?;
    watchdog.add_reset_timer(cfg.reset_period)?;

    info!(
        workers = cfg.workers.get(),
        messages = cfg.messages,
        "starting workers"
    );
    let handles: Vec<_> = (0..cfg.workers.get())
        .map(|id| {
            tokio::spawn(work(
                id,
                cfg.messages,
                dynamic.clone(),
                fixed.clone(),
                watchdog.handle(),
            ))
        })
        .collect();

    let mut messages = 0;
    for handle in handles {
        messages += handle.await??;
    }
    drop(watchdog);

    let report = Report {
        messages,
        dynamic_total_size: dynamic.total_size(),
        fixed_total_size: fixed.total_size(),
        fixed_available: fixed.available(),
    };
    info!(?report, "workers finished");
    Ok(report)
}

/// Process `messages` messages, returning how many completed.
async fn work(
    id: usize,
    messages: usize,
    dynamic: DynamicPool,
    fixed: FixedPool,
    liveness: Handle,
) -> Result<usize, Error> {
    // Cycle payload sizes through every class and past the largest one
    let largest = dynamic.classes().last().map_or(1, |class| class.get());
    for i in 0..messages {
        let mut slot = fixed.acquire().await?;

        let len = (id + i) % (largest * 2) + 1;
        let mut payload = dynamic.alloc(len);
        payload.as_mut().fill(id as u8);
        let copied = len.min(slot.size());
        slot.as_mut()[..copied].copy_from_slice(&payload.as_ref()[..copied]);

        // Hold the slot across a yield so other workers queue behind it
        tokio::task::yield_now().await;

        dynamic.release(payload);
        fixed.release(slot);
        liveness.reset();
    }
    debug!(id, messages, "worker finished");
    Ok(messages)
}
