//! Date range used to scope `list_events` calls.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Half-open instant range `[from, to)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        DateRange { from, to }
    }

    /// Range covering `date` padded by `days` on either side.
    pub fn around(date: NaiveDate, days: i64) -> Self {
        let midnight = date.and_time(chrono::NaiveTime::MIN).and_utc();
        DateRange {
            from: midnight - Duration::days(days),
            to: midnight + Duration::days(days + 1),
        }
    }

    /// Range covering both `self` and `other`.
    pub fn union(self, other: DateRange) -> Self {
        DateRange {
            from: self.from.min(other.from),
            to: self.to.max(other.to),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.from && instant < self.to
    }

    pub fn from_rfc3339(&self) -> String {
        self.from.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    pub fn to_rfc3339(&self) -> String {
        self.to.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}
