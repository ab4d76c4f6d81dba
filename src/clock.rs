//! Monotonic time source for latency measurement.
//!
//! The pipeline measures step latency against an injectable clock so that
//! timing behavior can be controlled in tests. The default clock reads
//! `tokio::time::Instant`, which follows tokio's virtual time when the
//! runtime clock is paused.

use tokio::time::Instant;

/// A monotonic clock the engine reads step timings from.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Default clock backed by `tokio::time::Instant`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
