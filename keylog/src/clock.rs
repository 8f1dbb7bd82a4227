use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::TimePrecision;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct MockClock {
    now: RwLock<DateTime<Utc>>,
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

impl MockClock {
    pub fn with_time(time: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn new() -> Self {
        Self::with_time(Utc::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write();
        *now += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.now.write() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out strictly increasing id timestamps.
///
/// Reads the clock at the configured precision and bumps the value past the
/// last one issued, so a burst of inserts within one clock tick (or a clock
/// stepping backwards) never yields a duplicate document id.
pub struct TimestampIssuer {
    clock: Arc<dyn Clock>,
    precision: TimePrecision,
    last: AtomicU64,
}

impl TimestampIssuer {
    pub fn new(clock: Arc<dyn Clock>, precision: TimePrecision) -> Self {
        Self {
            clock,
            precision,
            last: AtomicU64::new(0),
        }
    }

    fn read_clock(&self) -> u64 {
        let now = self.clock.now();
        let units = match self.precision {
            TimePrecision::Micros => now.timestamp_micros(),
            TimePrecision::Millis => now.timestamp_millis(),
        };
        // Pre-epoch clocks clamp to zero.
        u64::try_from(units).unwrap_or(0)
    }

    /// Next id timestamp; always greater than every previous one.
    pub fn next(&self) -> u64 {
        let now = self.read_clock();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    pub fn precision(&self) -> TimePrecision {
        self.precision
    }
}
