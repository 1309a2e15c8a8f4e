//! Connectivity analysis
//!
//! Buckets probe rows by a fixed granularity and classifies each bucket.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use linkwatch_model::{ConnectivityStatus, TimeRange};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Width of an aggregation bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granularity(Duration);

impl Granularity {
    pub fn new(width: Duration) -> Option<Self> {
        (width > Duration::zero()).then_some(Self(width))
    }

    pub fn width(&self) -> Duration {
        self.0
    }

    /// Start of the epoch-aligned bucket containing `t`
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.0.num_seconds().max(1);
        let secs = t.timestamp();
        let aligned = secs - secs.rem_euclid(width);
        DateTime::from_timestamp(aligned, 0).unwrap_or(t)
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Self(Duration::hours(1))
    }
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let width = match s.trim() {
            "minute" => Duration::minutes(1),
            "hour" => Duration::hours(1),
            "day" => Duration::days(1),
            other => parse_duration(other)?,
        };
        Granularity::new(width).ok_or_else(|| anyhow::anyhow!("Granularity must be positive"))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.num_seconds())
    }
}

/// Counts for one time bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityBucket {
    pub timestamp: DateTime<Utc>,
    pub up: u64,
    pub down: u64,
    pub degraded: u64,
    pub total: u64,
    pub status: ConnectivityStatus,
    pub uptime_percentage: f64,
    pub degraded_percentage: f64,
}

impl ConnectivityBucket {
    pub fn from_counts(timestamp: DateTime<Utc>, up: u64, down: u64, degraded: u64) -> Self {
        let total = up + down + degraded;
        Self {
            timestamp,
            up,
            down,
            degraded,
            total,
            status: bucket_status(down, degraded),
            uptime_percentage: percentage(up, total),
            degraded_percentage: percentage(degraded, total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySummary {
    pub total_checks: u64,
    pub up: u64,
    pub down: u64,
    pub degraded: u64,
    pub uptime_percentage: f64,
    pub degraded_percentage: f64,
}

/// Any down check makes the bucket down; otherwise any degraded check makes it degraded.
pub fn bucket_status(down: u64, degraded: u64) -> ConnectivityStatus {
    if down > 0 {
        ConnectivityStatus::Down
    } else if degraded > 0 {
        ConnectivityStatus::Degraded
    } else {
        ConnectivityStatus::Up
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Group `(timestamp, status)` samples into ordered buckets.
pub fn aggregate_connectivity(
    samples: &[(DateTime<Utc>, ConnectivityStatus)],
    granularity: Granularity,
) -> Vec<ConnectivityBucket> {
    let mut counts: BTreeMap<DateTime<Utc>, (u64, u64, u64)> = BTreeMap::new();

    for (t, status) in samples {
        let entry = counts.entry(granularity.bucket_start(*t)).or_default();
        match status {
            ConnectivityStatus::Up => entry.0 += 1,
            ConnectivityStatus::Down => entry.1 += 1,
            ConnectivityStatus::Degraded => entry.2 += 1,
        }
    }

    counts
        .into_iter()
        .map(|(t, (up, down, degraded))| ConnectivityBucket::from_counts(t, up, down, degraded))
        .collect()
}

pub fn summarize(buckets: &[ConnectivityBucket]) -> ConnectivitySummary {
    let up: u64 = buckets.iter().map(|b| b.up).sum();
    let down: u64 = buckets.iter().map(|b| b.down).sum();
    let degraded: u64 = buckets.iter().map(|b| b.degraded).sum();
    let total: u64 = buckets.iter().map(|b| b.total).sum();

    ConnectivitySummary {
        total_checks: total,
        up,
        down,
        degraded,
        uptime_percentage: percentage(up, total),
        degraded_percentage: percentage(degraded, total),
    }
}

/// Parse `30s`, `15m`, `24h`, `7d`
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
    let (value, unit) = s.split_at(split);
    let value: i64 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid duration format: {:?}. Use: 30s, 15m, 24h, 7d", s))?;
    let duration = match unit {
        "s" => Duration::try_seconds(value),
        "m" => Duration::try_minutes(value),
        "h" => Duration::try_hours(value),
        "d" => Duration::try_days(value),
        _ => anyhow::bail!("Invalid duration format: {:?}. Use: 30s, 15m, 24h, 7d", s),
    };
    duration.ok_or_else(|| anyhow::anyhow!("Duration out of range: {:?}", s))
}

/// Range ending now, e.g. `24h`
pub fn parse_last(s: &str) -> Result<TimeRange> {
    let duration = parse_duration(s)?;
    if duration <= Duration::zero() {
        anyhow::bail!("Range must be positive: {}", s);
    }
    TimeRange::last(duration).ok_or_else(|| anyhow::anyhow!("Range reaches too far back: {}", s))
}

/// `--last 24h` wins, then `--start`/`--end` as `YYYY-MM-DD HH:MM` UTC,
/// otherwise the last 24 hours.
pub fn resolve_range(
    last: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<TimeRange> {
    if let Some(last) = last {
        return parse_last(last);
    }
    match (start, end) {
        (Some(start), Some(end)) => {
            let start = parse_clock(start)?;
            let end = parse_clock(end)?;
            if end < start {
                anyhow::bail!("End of range is before its start");
            }
            Ok(TimeRange::new(start, end))
        }
        (None, None) => parse_last("24h"),
        _ => anyhow::bail!("Both start and end are required"),
    }
}

fn parse_clock(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let t = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .map_err(|e| anyhow::anyhow!("Invalid time {:?}: {}", s, e))?;
    Ok(t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn samples(t: DateTime<Utc>, up: u64, down: u64, degraded: u64) -> Vec<(DateTime<Utc>, ConnectivityStatus)> {
        let mut out = Vec::new();
        out.extend((0..up).map(|_| (t, ConnectivityStatus::Up)));
        out.extend((0..down).map(|_| (t, ConnectivityStatus::Down)));
        out.extend((0..degraded).map(|_| (t, ConnectivityStatus::Degraded)));
        out
    }

    #[test]
    fn test_bucket_status_and_overall_uptime() {
        let mut rows = samples(at(10, 5), 10, 0, 0);
        rows.extend(samples(at(11, 40), 8, 2, 0));

        let buckets = aggregate_connectivity(&rows, Granularity::default());
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].timestamp, at(10, 0));
        assert_eq!(buckets[0].status, ConnectivityStatus::Up);
        assert_eq!(buckets[1].status, ConnectivityStatus::Down);
        assert_eq!(buckets[1].total, 10);

        let summary = summarize(&buckets);
        assert_eq!(summary.total_checks, 20);
        assert!((summary.uptime_percentage - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_bucket() {
        let bucket = ConnectivityBucket::from_counts(at(9, 0), 7, 0, 3);
        assert_eq!(bucket.status, ConnectivityStatus::Degraded);
        assert!((bucket.degraded_percentage - 30.0).abs() < 1e-9);
        assert!((bucket.uptime_percentage - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input() {
        let buckets = aggregate_connectivity(&[], Granularity::default());
        assert!(buckets.is_empty());
        let summary = summarize(&buckets);
        assert_eq!(summary.total_checks, 0);
        assert_eq!(summary.uptime_percentage, 0.0);
    }

    #[test]
    fn test_granularity_parsing_and_alignment() {
        let five: Granularity = "5m".parse().unwrap();
        assert_eq!(five.width(), Duration::minutes(5));
        assert_eq!(five.bucket_start(at(10, 7)), at(10, 5));

        let day: Granularity = "day".parse().unwrap();
        assert_eq!(day.bucket_start(at(23, 59)), at(0, 0));

        assert!("0m".parse::<Granularity>().is_err());
        assert!("fortnight".parse::<Granularity>().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::hours(24));
        assert_eq!(parse_duration("7d").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("30m").unwrap(), Duration::minutes(30));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5w").is_err());
        assert!(parse_last("-1h").is_err());
    }

    #[test]
    fn test_oversized_values_are_errors() {
        assert!(parse_duration("99999999999999h").is_err());
        assert!(parse_duration("9223372036854775807s").is_err());
        assert!(resolve_range(Some("99999999999999h"), None, None).is_err());
        assert!(resolve_range(Some("100000000d"), None, None).is_err());
        assert!("99999999999999d".parse::<Granularity>().is_err());

        let wide: Granularity = "3650d".parse().unwrap();
        assert_eq!(wide.width(), Duration::days(3650));
    }

    #[test]
    fn test_resolve_range() {
        let range = resolve_range(None, Some("2024-05-01 09:00"), Some("2024-05-01 10:30")).unwrap();
        assert_eq!(range.start, at(9, 0));
        assert_eq!(range.end, at(10, 30));

        let range = resolve_range(Some("30m"), Some("2024-05-01 09:00"), None).unwrap();
        assert_eq!(range.end - range.start, Duration::minutes(30));

        let range = resolve_range(None, None, None).unwrap();
        assert_eq!(range.end - range.start, Duration::hours(24));

        assert!(resolve_range(None, Some("2024-05-01 09:00"), None).is_err());
        assert!(resolve_range(None, Some("2024-05-01 10:00"), Some("2024-05-01 09:00")).is_err());
    }
}
