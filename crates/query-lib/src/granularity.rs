//! Granularity planning
//!
//! Derives the bucket rule for a series query. An explicit unit truncates
//! timestamps to that unit; otherwise the width is derived from the length
//! of the requested range so that a query returns on the order of sixty
//! buckets, aligned to the hour, day or month.
//!
//! Buckets are always computed on the wall clock of the requested timezone.

use crate::error::{QueryError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

/// Literal timestamp format accepted in addition to RFC 3339
pub const PLAIN_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const MINUTES_PER_HOUR: i64 = 60;
const MINUTES_PER_DAY: i64 = 1440;

/// Calendar units accepted as an explicit granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "minute" => Ok(TimeUnit::Minute),
            "hour" => Ok(TimeUnit::Hour),
            "day" => Ok(TimeUnit::Day),
            "month" => Ok(TimeUnit::Month),
            "year" => Ok(TimeUnit::Year),
            _ => Err(()),
        }
    }
}

/// Fixed-width step chosen by auto mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketWidth {
    /// Aligned to the start of the hour
    Minutes(u32),
    /// Aligned to the start of the day
    Hours(u32),
    /// Aligned to the start of the month
    Days(u32),
}

impl BucketWidth {
    /// Pick a width for a range of the given length
    pub fn for_span(span: Duration) -> Self {
        // floor(diffMinutes / 60), forced to at least one
        let interval = (span.num_seconds() / 3600).max(1);

        if interval < MINUTES_PER_HOUR {
            BucketWidth::Minutes(interval as u32)
        } else if interval < MINUTES_PER_DAY {
            BucketWidth::Hours((interval / MINUTES_PER_HOUR) as u32)
        } else {
            BucketWidth::Days((interval / MINUTES_PER_DAY) as u32)
        }
    }

    pub fn width(self) -> u32 {
        match self {
            BucketWidth::Minutes(w) | BucketWidth::Hours(w) | BucketWidth::Days(w) => w,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Truncate(TimeUnit),
    Step(BucketWidth),
}

/// How each sample timestamp maps to its bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRule {
    pub kind: BucketKind,
    pub timezone: Tz,
}

impl BucketRule {
    /// Bucket start, expressed on the wall clock of the rule's timezone
    pub fn bucket_of(&self, ts: DateTime<Utc>) -> NaiveDateTime {
        let local = ts.with_timezone(&self.timezone).naive_local();
        let date = local.date();
        let midnight = date.and_time(NaiveTime::MIN);
        let hour_start = midnight + Duration::hours(local.hour() as i64);

        match self.kind {
            BucketKind::Truncate(TimeUnit::Minute) => {
                hour_start + Duration::minutes(local.minute() as i64)
            }
            BucketKind::Truncate(TimeUnit::Hour) => hour_start,
            BucketKind::Truncate(TimeUnit::Day) => midnight,
            BucketKind::Truncate(TimeUnit::Month) => month_start(date).and_time(NaiveTime::MIN),
            BucketKind::Truncate(TimeUnit::Year) => year_start(date).and_time(NaiveTime::MIN),
            BucketKind::Step(BucketWidth::Minutes(w)) => {
                let w = w.max(1);
                hour_start + Duration::minutes((local.minute() / w * w) as i64)
            }
            BucketKind::Step(BucketWidth::Hours(w)) => {
                let w = w.max(1);
                midnight + Duration::hours((local.hour() / w * w) as i64)
            }
            BucketKind::Step(BucketWidth::Days(w)) => {
                // Day of month is 1-based, matching DATE_PART('day', ...)
                let w = w.max(1);
                month_start(date).and_time(NaiveTime::MIN) + Duration::days((date.day() / w * w) as i64)
            }
        }
    }
}

impl fmt::Display for BucketRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BucketKind::Truncate(unit) => write!(f, "1 {} ({})", unit.as_str(), self.timezone),
            BucketKind::Step(BucketWidth::Minutes(w)) => write!(f, "{w} minute ({})", self.timezone),
            BucketKind::Step(BucketWidth::Hours(w)) => write!(f, "{w} hour ({})", self.timezone),
            BucketKind::Step(BucketWidth::Days(w)) => write!(f, "{w} day ({})", self.timezone),
        }
    }
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

fn year_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.ordinal0() as i64)
}

/// Half-open `[start, end)` query range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

/// Parse one bound of a date range
///
/// Accepts RFC 3339, or `YYYY-MM-DD HH:MM:SS` which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, PLAIN_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Validate a timezone name
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| QueryError::InvalidTimezone(name.to_string()))
}

/// A planned series window: the bound range plus its bucket rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesWindow {
    pub range: DateRange,
    pub rule: BucketRule,
}

/// Plan the bucketing of a series query
pub fn plan(date_range: &[String], timezone: Tz, granularity: Option<&str>) -> Result<SeriesWindow> {
    let [start, end] = date_range else {
        return Err(QueryError::InvalidDateRange(format!(
            "expected exactly 2 bounds, got {}",
            date_range.len()
        )));
    };

    let start = parse_timestamp(start)
        .ok_or_else(|| QueryError::InvalidDateRange(format!("unparseable start {start:?}")))?;
    let end = parse_timestamp(end)
        .ok_or_else(|| QueryError::InvalidDateRange(format!("unparseable end {end:?}")))?;
    if end <= start {
        return Err(QueryError::InvalidDateRange("end must come after start".into()));
    }
    let range = DateRange { start, end };

    let kind = match granularity.and_then(|g| g.parse::<TimeUnit>().ok()) {
        Some(unit) => BucketKind::Truncate(unit),
        None => BucketKind::Step(BucketWidth::for_span(range.span())),
    };

    Ok(SeriesWindow {
        range,
        rule: BucketRule { kind, timezone },
    })
}
