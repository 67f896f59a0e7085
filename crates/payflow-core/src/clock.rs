//! Clock abstraction for commit timestamps and scheduling.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Abstraction over wall-clock time so commits and schedules are testable.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Time left until `at`; zero if `at` has passed.
    fn delay_until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Frozen(DateTime<Utc>);

    impl Clock for Frozen {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn test_delay_until_future_and_past() {
        let now = Utc::now();
        let clock = Frozen(now);

        assert_eq!(
            clock.delay_until(now + chrono::Duration::seconds(30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            clock.delay_until(now - chrono::Duration::seconds(30)),
            Duration::ZERO
        );
    }
}
