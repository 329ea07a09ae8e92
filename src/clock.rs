//! Monotonic time sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic clock.
///
/// Liveness tracking only ever reads time through this trait so that tests can drive elapsed
/// time explicitly.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// A clock backed by the system's monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock.
#[derive(Debug)]
pub struct MockClock {
    base: Instant,
    elapsed_nanos: AtomicU64,
}

impl MockClock {
    /// Create a new instance frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed_nanos: AtomicU64::new(0),
        }
    }

    /// Move the clock forward by the given duration.
    ///
    /// The clock saturates at the latest instant it can represent.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _res = self.elapsed_nanos.fetch_update(Ordering::AcqRel, Ordering::Acquire, |elapsed| {
            let mut next = elapsed.saturating_add(nanos);
            while next > elapsed && self.base.checked_add(Duration::from_nanos(next)).is_none() {
                next = elapsed + (next - elapsed) / 2;
            }
            Some(next)
        });
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let elapsed = Duration::from_nanos(self.elapsed_nanos.load(Ordering::Acquire));
        self.base.checked_add(elapsed).unwrap_or(self.base)
    }
}
