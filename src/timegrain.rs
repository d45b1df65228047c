/// Time Grains and Calendar Helpers
///
/// Time dimensions are pivoted as buckets: every raw timestamp is truncated
/// to the start of its day, week, month, quarter or year and rendered as an
/// ISO 8601 date (`YYYY-MM-DD`). Because buckets and raw values are ISO
/// strings, a bucket can be turned back into a half-open string range
/// `[start, end)` and used in filters without any timestamp type.

use crate::value::PivotValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bucket size for a time dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }

    /// Truncate days-since-epoch to the first day of the bucket.
    pub fn truncate(&self, days: i32) -> i32 {
        match self {
            TimeGrain::Day => days,
            // 1970-01-01 was a Thursday; weeks start on Monday.
            TimeGrain::Week => days - (days + 3).rem_euclid(7),
            TimeGrain::Month => {
                let (y, m, _) = ymd_from_days(days);
                days_from_ymd(y, m, 1)
            }
            TimeGrain::Quarter => {
                let (y, m, _) = ymd_from_days(days);
                days_from_ymd(y, ((m - 1) / 3) * 3 + 1, 1)
            }
            TimeGrain::Year => {
                let (y, _, _) = ymd_from_days(days);
                days_from_ymd(y, 1, 1)
            }
        }
    }

    /// First day of the bucket following the one starting at `start`.
    pub fn next(&self, start: i32) -> i32 {
        match self {
            TimeGrain::Day => start + 1,
            TimeGrain::Week => start + 7,
            TimeGrain::Month => add_months(start, 1),
            TimeGrain::Quarter => add_months(start, 3),
            TimeGrain::Year => add_months(start, 12),
        }
    }

    /// Bucket a raw dimension value. Non-temporal values map to `Null`.
    pub fn bucket(&self, value: &PivotValue) -> PivotValue {
        match value.as_str().and_then(parse_datetime) {
            Some(ms) => {
                let days = ms.div_euclid(86_400_000) as i32;
                PivotValue::String(format_date(self.truncate(days)))
            }
            None => PivotValue::Null,
        }
    }

    /// Half-open ISO range `[start, end)` covered by a bucket label.
    pub fn bucket_range(&self, bucket: &PivotValue) -> Option<(String, String)> {
        let start = bucket.as_str().and_then(parse_datetime)?;
        let start = self.truncate(start.div_euclid(86_400_000) as i32);
        Some((format_date(start), format_date(self.next(start))))
    }
}

impl fmt::Display for TimeGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Half-open time range `[start, end)` as ISO 8601 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

impl TimeRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        TimeRange {
            start: start.into(),
            end: end.into(),
        }
    }

    /// ISO strings order chronologically, so containment is a string compare.
    pub fn contains(&self, value: &PivotValue) -> bool {
        match value.as_str() {
            Some(v) => v >= self.start.as_str() && v < self.end.as_str(),
            None => false,
        }
    }
}

fn add_months(days: i32, months: u32) -> i32 {
    let (y, m, d) = ymd_from_days(days);
    let total = (m - 1) + months;
    days_from_ymd(y + (total / 12) as i32, total % 12 + 1, d)
}

/// Convert days since Unix epoch (1970-01-01) to (year, month, day)
pub fn ymd_from_days(days: i32) -> (i32, u32, u32) {
    // Algorithm from https://howardhinnant.github.io/date_algorithms.html
    let z = days + 719468;
    let era = if z >= 0 { z / 146097 } else { (z - 146096) / 146097 };
    let doe = (z - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = (yoe as i32) + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if m <= 2 { y + 1 } else { y };
    (year, m, d)
}

/// Convert (year, month, day) to days since Unix epoch
pub fn days_from_ymd(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y / 400 } else { (y - 399) / 400 };
    let yoe = (y - era * 400) as u32;
    let m = month;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    (era * 146097 + doe as i32) - 719468
}

/// Format a date (days since epoch) as YYYY-MM-DD
pub fn format_date(days: i32) -> String {
    let (year, month, day) = ymd_from_days(days);
    format!("{:04}-{:02}-{:02}", year, month, day)
}

/// Parse an ISO 8601 date string (YYYY-MM-DD) to days since epoch
pub fn parse_date(s: &str) -> Option<i32> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    let year: i32 = parts[0].parse().ok()?;
    let month: u32 = parts[1].parse().ok()?;
    let day: u32 = parts[2].parse().ok()?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    Some(days_from_ymd(year, month, day))
}

/// Parse an ISO 8601 date or datetime string to milliseconds since epoch
pub fn parse_datetime(s: &str) -> Option<i64> {
    let (date_part, time_part) = match s.find(|c: char| c == 'T' || c == ' ') {
        Some(idx) => (&s[..idx], &s[idx + 1..]),
        // Just a date, treat as midnight
        None => return parse_date(s).map(|d| (d as i64) * 86_400_000),
    };

    let days = parse_date(date_part)?;

    let time_part = time_part.trim_end_matches('Z');
    let time_str = time_part.split('.').next().unwrap_or(time_part);
    let time_parts: Vec<&str> = time_str.split(':').collect();
    if time_parts.len() < 2 {
        return None;
    }

    let hour: u32 = time_parts[0].parse().ok()?;
    let minute: u32 = time_parts[1].parse().ok()?;
    let second: u32 = time_parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }

    let time_ms = (hour as i64) * 3_600_000 + (minute as i64) * 60_000 + (second as i64) * 1000;

    Some((days as i64) * 86_400_000 + time_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_round_trip() {
        let days = parse_date("2024-02-29").unwrap();
        assert_eq!(format_date(days), "2024-02-29");
        assert_eq!(parse_date("1970-01-01"), Some(0));
        assert_eq!(parse_date("2024-13-01"), None);
    }

    #[test]
    fn test_bucket_values() {
        let value = PivotValue::from("2024-05-17T13:45:00Z");
        assert_eq!(TimeGrain::Day.bucket(&value), PivotValue::from("2024-05-17"));
        // 2024-05-17 is a Friday
        assert_eq!(TimeGrain::Week.bucket(&value), PivotValue::from("2024-05-13"));
        assert_eq!(TimeGrain::Month.bucket(&value), PivotValue::from("2024-05-01"));
        assert_eq!(TimeGrain::Quarter.bucket(&value), PivotValue::from("2024-04-01"));
        assert_eq!(TimeGrain::Year.bucket(&value), PivotValue::from("2024-01-01"));
        assert_eq!(TimeGrain::Day.bucket(&PivotValue::Int64(3)), PivotValue::Null);
    }

    #[test]
    fn test_bucket_range() {
        let range = TimeGrain::Month.bucket_range(&PivotValue::from("2024-12-01")).unwrap();
        assert_eq!(range, ("2024-12-01".to_string(), "2025-01-01".to_string()));

        let range = TimeGrain::Quarter.bucket_range(&PivotValue::from("2024-10-01")).unwrap();
        assert_eq!(range, ("2024-10-01".to_string(), "2025-01-01".to_string()));
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new("2024-01-01", "2024-02-01");
        assert!(range.contains(&PivotValue::from("2024-01-31T23:59:59")));
        assert!(!range.contains(&PivotValue::from("2024-02-01")));
        assert!(!range.contains(&PivotValue::Int64(1)));
    }
}
