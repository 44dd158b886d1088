//! Wall-clock source.
//!
//! Budget periods, rate-limiter refills, health staleness and audit
//! timestamps all read time through [`Clock`] so they can be driven
//! deterministically in tests (see `test_utils::ManualClock`).

use chrono::{DateTime, Utc};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
