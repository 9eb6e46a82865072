//! Sync time-window helpers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A bounded UTC time range, used for full calendar queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    /// Creates a window from explicit bounds.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The full-sync window around `now`: `lookbehind` days of history and
    /// `lookahead` days of future.
    pub fn around(now: DateTime<Utc>, lookbehind_days: i64, lookahead_days: i64) -> Self {
        Self {
            start: now - Duration::days(lookbehind_days),
            end: now + Duration::days(lookahead_days),
        }
    }

    /// Returns true if `instant` falls within the window (start inclusive,
    /// end exclusive).
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn around_now() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let window = SyncWindow::around(now, 90, 180);
        assert_eq!(window.start, now - Duration::days(90));
        assert_eq!(window.end, now + Duration::days(180));
        assert!(window.contains(now));
        assert!(!window.contains(now + Duration::days(181)));
    }
}
