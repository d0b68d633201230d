use crate::query::Dialect;
use crate::sql::Sql;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Width of one time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Bucket width in milliseconds. Buckets are UTC, so every day is 24h.
    pub const fn step_millis(self) -> i64 {
        match self {
            Self::Minute => MINUTE_MS,
            Self::Hour => HOUR_MS,
            Self::Day => DAY_MS,
        }
    }

    /// Start of the bucket containing `millis`.
    pub const fn floor_millis(self, millis: i64) -> i64 {
        millis - millis.rem_euclid(self.step_millis())
    }

    /// Start of the bucket containing `at`, as epoch millis.
    pub fn floor(self, at: DateTime<Utc>) -> i64 {
        self.floor_millis(at.timestamp_millis())
    }

    /// Bucket-start expression over the `timestamp` column. It has to truncate
    /// exactly like [`Granularity::floor_millis`] so rows land on the keys the
    /// presenters step through. DuckDB returns epoch millis directly.
    pub const fn bucket_expr(self, dialect: Dialect) -> Sql {
        let text = match (dialect, self) {
            (Dialect::ClickHouse, Self::Minute) => "toStartOfMinute(timestamp)",
            (Dialect::ClickHouse, Self::Hour) => "toStartOfHour(timestamp)",
            (Dialect::ClickHouse, Self::Day) => "toStartOfDay(timestamp)",
            (Dialect::DuckDb, Self::Minute) => "epoch_ms(date_trunc('minute', timestamp))",
            (Dialect::DuckDb, Self::Hour) => "epoch_ms(date_trunc('hour', timestamp))",
            (Dialect::DuckDb, Self::Day) => "epoch_ms(date_trunc('day', timestamp))",
        };
        Sql::raw(text)
    }

    /// Granularities that keep a chart over `[start, end]` readable.
    pub fn allowed_for_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Self> {
        let duration_ms = end.timestamp_millis() - start.timestamp_millis();
        if duration_ms >= 7 * DAY_MS {
            vec![Self::Day]
        } else if duration_ms <= DAY_MS {
            vec![Self::Day, Self::Hour, Self::Minute]
        } else {
            vec![Self::Day, Self::Hour]
        }
    }

    /// `self` if allowed, otherwise the next coarser allowed granularity.
    pub fn or_fallback(self, allowed: &[Self]) -> Self {
        if allowed.contains(&self) {
            return self;
        }
        if self == Self::Minute && allowed.contains(&Self::Hour) {
            Self::Hour
        } else {
            Self::Day
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
