use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use super::SchemaError;

/// Width of a time bucket, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    /// yyyyMMddHHmm
    Minute,
    /// yyyyMMddHH
    Hour,
    /// yyyyMMdd
    Day,
    /// yyyyMM
    Month,
}

impl Granularity {
    fn digits(self) -> u32 {
        match self {
            Self::Minute => 12,
            Self::Hour => 10,
            Self::Day => 8,
            Self::Month => 6,
        }
    }

    fn from_digits(digits: u32) -> Option<Self> {
        match digits {
            12 => Some(Self::Minute),
            10 => Some(Self::Hour),
            8 => Some(Self::Day),
            6 => Some(Self::Month),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar-truncated UTC timestamp encoded as decimal digits, e.g.
/// `202401151030` for the minute 2024-01-15 10:30.
///
/// The granularity is implied by the digit count, so a bucket always
/// round-trips through its integer form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket {
    value: i64,
    granularity: Granularity,
}

impl TimeBucket {
    /// Parses an encoded bucket, validating the calendar fields.
    pub fn new(value: i64) -> Result<Self, SchemaError> {
        let digits = match value.checked_ilog10() {
            Some(log) if value > 0 => log + 1,
            _ => return Err(SchemaError::InvalidTimeBucket(value)),
        };
        let granularity =
            Granularity::from_digits(digits).ok_or(SchemaError::InvalidTimeBucket(value))?;

        let (year, month, day, hour, minute) = split(value, granularity);
        let valid = i32::try_from(year)
            .ok()
            .and_then(|year| NaiveDate::from_ymd_opt(year, month, day))
            .and_then(|date| date.and_hms_opt(hour, minute, 0))
            .is_some();
        if !valid {
            return Err(SchemaError::InvalidTimeBucket(value));
        }

        Ok(Self { value, granularity })
    }

    /// Buckets a UTC instant at the given granularity.
    pub fn from_datetime(at: &DateTime<Utc>, granularity: Granularity) -> Result<Self, SchemaError> {
        let year = i64::from(at.year());
        if !(1000..=9999).contains(&year) {
            return Err(SchemaError::TimestampOutOfRange(at.timestamp_millis()));
        }

        let month = i64::from(at.month());
        let day = i64::from(at.day());
        let hour = i64::from(at.hour());
        let minute = i64::from(at.minute());

        let value = match granularity {
            Granularity::Month => year * 100 + month,
            Granularity::Day => (year * 100 + month) * 100 + day,
            Granularity::Hour => ((year * 100 + month) * 100 + day) * 100 + hour,
            Granularity::Minute => {
                (((year * 100 + month) * 100 + day) * 100 + hour) * 100 + minute
            }
        };

        Ok(Self { value, granularity })
    }

    /// Minute bucket for a millisecond Unix timestamp, in UTC.
    pub fn minute_from_millis(millis: i64) -> Result<Self, SchemaError> {
        let at = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or(SchemaError::TimestampOutOfRange(millis))?;
        Self::from_datetime(&at, Granularity::Minute)
    }

    /// Truncates to a coarser (or equal) granularity.
    pub fn to_granularity(self, target: Granularity) -> Result<Self, SchemaError> {
        if target < self.granularity {
            return Err(SchemaError::FinerGranularity {
                from: self.granularity,
                to: target,
            });
        }

        let drop = self.granularity.digits() - target.digits();
        Ok(Self {
            value: self.value / 10i64.pow(drop),
            granularity: target,
        })
    }

    pub fn value(self) -> i64 {
        self.value
    }

    pub fn granularity(self) -> Granularity {
        self.granularity
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

fn split(value: i64, granularity: Granularity) -> (i64, u32, u32, u32, u32) {
    // Calendar fields are two digits each, so the casts cannot truncate.
    let two = |v: i64| (v % 100) as u32;
    match granularity {
        Granularity::Month => (value / 100, two(value), 1, 0, 0),
        Granularity::Day => (value / 10_000, two(value / 100), two(value), 0, 0),
        Granularity::Hour => (
            value / 1_000_000,
            two(value / 10_000),
            two(value / 100),
            two(value),
            0,
        ),
        Granularity::Minute => (
            value / 100_000_000,
            two(value / 1_000_000),
            two(value / 10_000),
            two(value / 100),
            two(value),
        ),
    }
}
