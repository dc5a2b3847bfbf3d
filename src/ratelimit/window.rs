//! Window boundary arithmetic.

use std::time::Duration;

/// Floor `timestamp` to a multiple of `precision_secs`.
///
/// Uses Euclidean remainder so instants before the epoch also floor downward.
/// A non-positive precision leaves the timestamp unchanged.
pub fn truncate(timestamp: i64, precision_secs: i64) -> i64 {
    if precision_secs <= 0 {
        return timestamp;
    }
    timestamp.saturating_sub(timestamp.rem_euclid(precision_secs))
}

/// The truncated boundaries of a lookback window, in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    /// `truncate(now - window_size, precision)`
    pub start: i64,
    /// `truncate(now, precision)`
    pub end: i64,
}

impl Window {
    /// Compute the window ending at `now`.
    pub fn at(now: i64, window_size: Duration, precision: Duration) -> Self {
        let precision_secs = duration_secs(precision);
        let window_secs = duration_secs(window_size);

        Self {
            start: truncate(now.saturating_sub(window_secs), precision_secs),
            end: truncate(now, precision_secs),
        }
    }

    /// Build a window from raw boundaries, without checking their order.
    pub fn from_bounds(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Seconds between the two boundaries. Negative only when misconfigured.
    pub fn length(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the boundaries are ordered.
    pub fn is_valid(&self) -> bool {
        self.length() >= 0
    }

    /// Whether `timestamp` falls within `[start, end]`.
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

pub(crate) fn duration_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
