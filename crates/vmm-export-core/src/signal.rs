//! Refresh broadcast.
//!
//! Waiters block until the refresh loop finishes its next cycle. Every waiter is
//! released on every cycle and re-checks its own condition; the signal carries no
//! payload.
//!
//! Implemented as a generation counter behind a mutex with a condition variable.
//! A waiter remembers the generation it registered in and returns once the
//! generation has moved on, so a release can neither be missed nor delivered
//! twice. Draining the pending count and advancing the generation happen in the
//! same critical section: a waiter that registers after the drain belongs to the
//! next cycle.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct SignalState {
    generation: u64,
    pending: usize,
    cancelled: bool,
}

#[derive(Debug, Default)]
pub struct RefreshSignal {
    state: Mutex<SignalState>,
    released: Condvar,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the next [`release`](Self::release).
    ///
    /// Returns [`Error::Cancelled`] if the signal is (or becomes) cancelled.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(Error::Cancelled);
        }
        let registered_in = state.generation;
        state.pending += 1;

        // Condvar wakeups may be spurious; only a generation change counts.
        while state.generation == registered_in {
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Number of callers currently blocked in [`wait`](Self::wait).
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Release every pending waiter and start a new generation.
    ///
    /// Returns how many waiters were released.
    pub fn release(&self) -> usize {
        let mut state = self.lock();
        let released = std::mem::take(&mut state.pending);
        state.generation = state.generation.wrapping_add(1);
        drop(state);
        self.released.notify_all();
        released
    }

    /// Abandon every current and future wait.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        state.pending = 0;
        drop(state);
        self.released.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Sleep for `duration`, cut short by cancellation.
    ///
    /// A duration too large to represent as a deadline sleeps until cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(duration);
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            let Some(deadline) = deadline else {
                state = self
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
