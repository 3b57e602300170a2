//! Injectable time source.
//!
//! Rate-limit windows, error timestamps, and log entries read the clock
//! through [`Clock`] so that tests can move time forward deterministically
//! with [`MockClock`]. Suspension inside retry loops still uses
//! `tokio::time::sleep`.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// System clock (production use).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock at the given instant.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(time)),
        }
    }

    /// Create a mock clock at a fixed instant (2026-01-15 12:00:00 UTC).
    pub fn fixed() -> Self {
        let time = DateTime::from_timestamp(1_768_478_400, 0).unwrap_or_default();
        Self::new(time)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let delta = Duration::from_std(by).unwrap_or(Duration::MAX);
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += delta;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::fixed()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;
