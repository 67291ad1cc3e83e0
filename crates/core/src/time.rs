use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// A simple clock abstraction for deterministic time in services and tests.
///
/// `Manual` clocks share their instant between clones, so a test can hand one
/// copy to a session and advance another.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    Default,
    Fixed(DateTime<Utc>),
    Manual(Arc<Mutex<DateTime<Utc>>>),
}

impl Clock {
    /// Returns a clock that uses the current system time.
    #[must_use]
    pub fn default_clock() -> Self {
        Self::Default
    }

    /// Returns a clock fixed at the given timestamp.
    #[must_use]
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self::Fixed(at)
    }

    /// Returns a shareable clock starting at the given timestamp.
    #[must_use]
    pub fn manual(at: DateTime<Utc>) -> Self {
        Self::Manual(Arc::new(Mutex::new(at)))
    }

    /// Returns the current time according to the clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::Default => Utc::now(),
            Clock::Fixed(t) => *t,
            Clock::Manual(shared) => *shared.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Advance a fixed or manual clock by the given duration.
    ///
    /// Has no effect on `Clock::Default`. Advancing a manual clock is visible
    /// to every clone of it.
    pub fn advance(&mut self, delta: Duration) {
        match self {
            Clock::Default => {}
            Clock::Fixed(t) => *t += delta,
            Clock::Manual(shared) => {
                *shared.lock().unwrap_or_else(PoisonError::into_inner) += delta;
            }
        }
    }
}

/// Whole minutes elapsed between two instants, floor-rounded.
///
/// Returns zero when `until` precedes `since`.
#[must_use]
pub fn whole_minutes_between(since: DateTime<Utc>, until: DateTime<Utc>) -> u32 {
    let minutes = (until - since).num_minutes();
    u32::try_from(minutes.max(0)).unwrap_or(u32::MAX)
}

/// Deterministic timestamp for tests and examples (2023-11-14T22:13:20Z).
pub const FIXED_TEST_TIMESTAMP: i64 = 1_700_000_000;

/// Returns a deterministic `DateTime<Utc>` for tests and doc examples.
///
/// # Panics
///
/// Panics if the fixed timestamp cannot be represented.
#[must_use]
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(FIXED_TEST_TIMESTAMP, 0)
        .expect("fixed timestamp should be valid")
}

/// Returns a `Clock` fixed at the deterministic test timestamp.
#[must_use]
pub fn fixed_clock() -> Clock {
    Clock::fixed(fixed_now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let mut driver = Clock::manual(fixed_now());
        let observer = driver.clone();
        driver.advance(Duration::minutes(3));
        assert_eq!(observer.now(), fixed_now() + Duration::minutes(3));
    }

    #[test]
    fn fixed_clock_copies_are_independent() {
        let mut a = fixed_clock();
        let b = a.clone();
        a.advance(Duration::seconds(30));
        assert_eq!(b.now(), fixed_now());
    }

    #[test]
    fn whole_minutes_floor_and_clamp() {
        let start = fixed_now();
        assert_eq!(whole_minutes_between(start, start + Duration::seconds(179)), 2);
        assert_eq!(whole_minutes_between(start, start - Duration::minutes(5)), 0);
    }
}
