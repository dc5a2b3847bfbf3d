//! Time sources for admission checks and the in-process store.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of the current Unix time in whole seconds.
pub trait Clock: Send + Sync {
    /// Current Unix timestamp in seconds.
    fn now(&self) -> i64;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time value, so a clock handed to a limiter and a
/// store can be advanced from a test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock fixed at `start` (Unix seconds).
    pub fn new(start: i64) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let secs = i64::try_from(by.as_secs()).unwrap_or(i64::MAX);
        self.current.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to a specific timestamp.
    pub fn set(&self, timestamp: i64) {
        self.current.store(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock::new().now() > 1_577_836_800);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);

        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.now(), 1_061);

        let shared = clock.clone();
        shared.set(5_000);
        assert_eq!(clock.now(), 5_000);
    }
}
