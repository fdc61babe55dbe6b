//! Exponential backoff used for netlink resyncs and route installation
//! retries.

use std::time::{Duration, Instant};

/// Interval multiplier applied after each attempt.
const MULTIPLIER: u32 = 2;

/// An exponential backoff without an elapsed-time cap: the interval
/// doubles after each attempt until it reaches `max`, and the caller
/// retries forever until it succeeds or is stopped.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            started: Instant::now(),
        }
    }

    /// Restarts the backoff from its initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.started = Instant::now();
    }

    /// Returns the interval to wait before the next attempt and advances
    /// the backoff.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        self.current = (self.current * MULTIPLIER).min(self.max);
        interval
    }

    /// Time spent since the backoff was created or last reset. Used to
    /// escalate log severity on long-running failures.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
