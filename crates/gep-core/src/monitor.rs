//! Subscriber health monitors.
//!
//! Both monitors are pure bookkeeping over the environment's instants; the
//! subscriber turns their errors into a `Restart` action.

use std::{collections::VecDeque, ops::Sub, time::Duration};

use crate::{env::elapsed, error::SessionError};

/// Detects a silent data stream.
#[derive(Debug, Clone)]
pub struct DataLossMonitor<I> {
    interval: Duration,
    last_data: Option<I>,
}

impl<I> DataLossMonitor<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Disarmed monitor
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval, last_data: None }
    }

    /// Start (or restart) the countdown at `now`.
    pub fn arm(&mut self, now: I) {
        self.last_data = Some(now);
    }

    /// Stop watching.
    pub fn disarm(&mut self) {
        self.last_data = None;
    }

    /// Whether the monitor is counting
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.last_data.is_some()
    }

    /// Data arrived.
    pub fn record(&mut self, now: I) {
        if self.last_data.is_some() {
            self.last_data = Some(now);
        }
    }

    /// Check for loss. Firing disarms the monitor until the next `arm`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DataLoss`] when no data arrived for the
    /// interval.
    pub fn check(&mut self, now: I) -> Result<(), SessionError> {
        let Some(last) = self.last_data else {
            return Ok(());
        };
        let silent = elapsed(last, now);
        if self.interval > Duration::ZERO && silent >= self.interval {
            self.last_data = None;
            return Err(SessionError::DataLoss { elapsed: silent });
        }
        Ok(())
    }
}

/// Counts parse faults inside a sliding window.
#[derive(Debug, Clone)]
pub struct ParseErrorWindow<I> {
    allowed: usize,
    window: Duration,
    faults: VecDeque<I>,
}

impl<I> ParseErrorWindow<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Window tolerating `allowed` faults per `window`
    #[must_use]
    pub const fn new(allowed: usize, window: Duration) -> Self {
        Self { allowed, window, faults: VecDeque::new() }
    }

    /// Faults currently inside the window
    #[must_use]
    pub fn count(&self) -> usize {
        self.faults.len()
    }

    /// Record a fault at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TooManyParseErrors`] once more than `allowed`
    /// faults fall inside the window; the window is cleared when it fires.
    pub fn record(&mut self, now: I) -> Result<(), SessionError> {
        while self.faults.front().is_some_and(|first| elapsed(*first, now) > self.window) {
            self.faults.pop_front();
        }
        self.faults.push_back(now);

        if self.faults.len() > self.allowed {
            let count = self.faults.len();
            self.faults.clear();
            return Err(SessionError::TooManyParseErrors { count, window: self.window });
        }
        Ok(())
    }

    /// Forget all faults.
    pub fn reset(&mut self) {
        self.faults.clear();
    }
}
