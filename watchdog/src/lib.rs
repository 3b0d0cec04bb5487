//! Abort a stalled process unless it periodically proves liveness.
//!
//! A [Watchdog] runs a background task that increments a tick counter once per
//! [Config::period]. Any call to [Watchdog::reset] (or [Handle::reset]) clears the counter. If the
//! counter ever exceeds one (a full period elapsed without a reset), the watchdog logs the stall
//! and runs its expiry action, which by default aborts the process.
//!
//! Liveness can be proven explicitly (by calling `reset` from a loop that must keep making
//! progress) or implicitly with [Watchdog::add_reset_timer], which resets the counter from a
//! periodic task. The latter only proves that the runtime is still scheduling tasks.
//!
//! # Example
//!
//! ```rust,no_run
//! use bufq_watchdog::{Config, Watchdog};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut watchdog = Watchdog::start(Config::new(Duration::from_secs(1))).unwrap();
//! watchdog.add_reset_timer(Duration::from_millis(250)).unwrap();
//! # }
//! ```

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Errors that can occur when starting a [Watchdog].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("period must be non-zero")]
    ZeroPeriod,
}

/// Configuration for a [Watchdog].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// How often the tick counter is incremented.
    ///
    /// The watchdog expires between one and two periods after the last reset.
    pub period: Duration,
}

impl Config {
    pub const fn new(period: Duration) -> Self {
        Self { period }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.period.is_zero() {
            return Err(Error::ZeroPeriod);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// A clonable handle that can only reset the [Watchdog] it was taken from.
#[derive(Clone, Debug)]
pub struct Handle {
    ticks: Arc<AtomicU64>,
}

impl Handle {
    /// Clear the tick counter.
    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Release);
    }
}

/// A running watchdog.
///
/// Dropping the watchdog stops its monitor and every reset timer.
pub struct Watchdog {
    ticks: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl Watchdog {
    /// Start a watchdog that aborts the process on expiry.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(cfg: Config) -> Result<Self, Error> {
        Self::with_expiry(cfg, || std::process::abort())
    }

    /// Start a watchdog that runs `expiry` (once) instead of aborting the process.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn with_expiry<F>(cfg: Config, expiry: F) -> Result<Self, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        cfg.validate()?;
        let ticks = Arc::new(AtomicU64::new(0));
        let monitor = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    tokio::time::sleep(cfg.period).await;
                    let elapsed = ticks.fetch_add(1, Ordering::AcqRel) + 1;
                    if elapsed > 1 {
                        error!(period = ?cfg.period, ticks = elapsed, "watchdog expired");
                        expiry();
                        return;
                    }
                }
            }
        });
        debug!(period = ?cfg.period, "watchdog started");
        Ok(Self {
            ticks,
            tasks: vec![monitor],
        })
    }

    /// Clear the tick counter.
    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Release);
    }

    /// Returns a handle that can reset this watchdog from elsewhere.
    pub fn handle(&self) -> Handle {
        Handle {
            ticks: self.ticks.clone(),
        }
    }

    /// Reset the watchdog every `period` from a background task.
    pub fn add_reset_timer(&mut self, period: Duration) -> Result<(), Error> {
        if period.is_zero() {
            return Err(Error::ZeroPeriod);
        }
        let handle = self.handle();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                handle.reset();
            }
        }));
        debug!(?period, "watchdog reset timer armed");
        Ok(())
    }

    /// Number of periods elapsed since the last reset.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
