//! Epoch-aligned budget periods.

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// How often a scope's consumption resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Resets at the top of every UTC hour.
    Hourly,
    /// Resets at UTC midnight.
    Daily,
}

impl BudgetPeriod {
    /// Length of one period in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Hourly => 3_600,
            Self::Daily => 86_400,
        }
    }

    /// Start of the period containing `at`.
    pub fn start_of(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let into = at.timestamp().rem_euclid(self.seconds());
        at - TimeDelta::seconds(into) - TimeDelta::nanoseconds(i64::from(at.nanosecond()))
    }

    /// Start of the period after the one containing `at`.
    pub fn next_reset(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.start_of(at) + TimeDelta::seconds(self.seconds())
    }

    /// Time left in the period containing `at`.
    pub fn remaining(&self, at: DateTime<Utc>) -> TimeDelta {
        self.next_reset(at) - at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn aligns_to_boundaries() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 13, 27, 9).unwrap();
        assert_eq!(
            BudgetPeriod::Hourly.start_of(at),
            Utc.with_ymd_and_hms(2025, 3, 4, 13, 0, 0).unwrap()
        );
        assert_eq!(
            BudgetPeriod::Daily.start_of(at),
            Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap()
        );
        assert_eq!(
            BudgetPeriod::Daily.next_reset(at),
            Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap()
        );
        assert_eq!(BudgetPeriod::Hourly.remaining(at).num_seconds(), 32 * 60 + 51);
    }

    #[test]
    fn boundary_instant_starts_new_period() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap();
        assert_eq!(BudgetPeriod::Daily.start_of(at), at);
    }
}
