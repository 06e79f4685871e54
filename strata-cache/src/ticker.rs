//! Monotonic time sources for expiry checks.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic clock. Readings are offsets from an arbitrary fixed origin.
pub trait Ticker: Send + Sync + Debug {
    fn read(&self) -> Duration;
}

/// Ticker backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually driven ticker for deterministic expiry tests.
#[derive(Debug, Default)]
pub struct FakeTicker {
    nanos: AtomicU64,
}

impl FakeTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }
}

impl Ticker for FakeTicker {
    fn read(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}
