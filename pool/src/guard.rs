//! Scoped mutual exclusion over pool bookkeeping.
//!
//! A [CriticalSection] is entered with [CriticalSection::enter] and left when the returned
//! [Guard] is dropped, on every exit path (including unwinding).
//!
//! Critical sections are not reentrant. Nothing that can call back into a pool (such as
//! delivering a buffer to a [crate::Notify] target) may run while a [Guard] is held. In debug
//! builds, entering a section that the current thread already holds panics instead of
//! deadlocking.

use std::{
    ops::{Deref, DerefMut},
    sync::{Mutex, MutexGuard, PoisonError},
};

#[cfg(debug_assertions)]
std::thread_local! {
    /// Addresses of the critical sections held by this thread.
    static HELD: std::cell::RefCell<Vec<usize>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// Exclusive access to some state `T`.
#[derive(Debug, Default)]
pub struct CriticalSection<T> {
    state: Mutex<T>,
}

impl<T> CriticalSection<T> {
    /// Creates a new critical section protecting `state`.
    pub const fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Enters the critical section, waiting for any other holder to leave.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the current thread already holds this section.
    pub fn enter(&self) -> Guard<'_, T> {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            assert!(
                !held.contains(&self.addr()),
                "critical section re-entered"
            );
            held.push(self.addr());
        });

        // A panic while held (e.g. a failed release assertion) leaves the
        // bookkeeping as it was before the panicking call mutated it.
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Guard {
            state,
            #[cfg(debug_assertions)]
            addr: self.addr(),
        }
    }

    /// Consumes the critical section, returning the protected state.
    pub fn into_inner(self) -> T {
        self.state.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(debug_assertions)]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

/// Proof of being inside a [CriticalSection]. Leaves the section when dropped.
pub struct Guard<'a, T> {
    state: MutexGuard<'a, T>,
    #[cfg(debug_assertions)]
    addr: usize,
}

impl<T> Deref for Guard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T> DerefMut for Guard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.state
    }
}

#[cfg(debug_assertions)]
impl<T> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        // try_with: the thread-local may already be gone during thread teardown.
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(position) = held.iter().rposition(|&addr| addr == self.addr) {
                held.swap_remove(position);
            }
        });
    }
}
