//! Time ranges used by history queries

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Closed interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window of `duration` ending now, `None` if its start is not representable
    pub fn last(duration: Duration) -> Option<Self> {
        let end = Utc::now();
        let start = end.checked_sub_signed(duration)?;
        Some(Self { start, end })
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}
