//! Wall-clock source for event timestamps.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use studysync_protocol::Timestamp;

/// Source of generation-time timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A deterministic clock for tests.
///
/// Every call to [`Clock::now`] returns the current instant and then
/// advances it by one millisecond, so consecutive timestamps are strictly
/// increasing.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Moves the clock forward (or backward, for skew tests).
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Sets the clock.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let mut current = self.current.lock();
        let at = *current;
        *current += Duration::milliseconds(1);
        Timestamp::from_datetime(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_is_strictly_increasing() {
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let first = clock.now();
        let second = clock.now();
        assert_eq!(first.as_str(), "2024-01-01T00:00:00.000Z");
        assert_eq!(second.as_str(), "2024-01-01T00:00:00.001Z");
    }

    #[test]
    fn manual_clock_can_move_backwards() {
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let now = clock.now();
        clock.advance(Duration::seconds(-10));
        assert!(clock.now() < now);
    }
}
