//! Presentation of raw aggregation rows as chart-ready data.
//!
//! Everything here is a pure function of its inputs. Time-series presenters
//! emit one bucket for every granularity step in the requested range, so the
//! output never has gaps regardless of what the store returned.

pub mod area;
pub mod compare;
pub mod funnel;
pub mod pie;
pub mod stacked;

pub use area::{bucket_keys, bucket_series, to_area_chart, AreaChart};
pub use compare::{align, ComparisonMapping};
pub use funnel::{analyze_funnel, FunnelStep, PresentedFunnel, VisitorCount};
pub use pie::{to_pie_chart, BreakdownRow, PieSlice};
pub use stacked::{sorted_categories, to_stacked_chart, StackedChart};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The range of equal length ending just before this one starts.
    pub fn previous(&self) -> Self {
        let length = self.end - self.start;
        let end = self.start - chrono::Duration::seconds(1);
        Self {
            start: end - length,
            end,
        }
    }
}

/// One `(bucket start, value)` row from a time-series query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    pub date: DateTime<Utc>,
    pub value: f64,
}

/// One `(bucket start, category, value)` row from a breakdown-over-time query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCategoryPoint {
    pub date: DateTime<Utc>,
    pub category: String,
    pub value: f64,
}

/// Rows of a comparison period along with the range they were queried for.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparePeriod<R> {
    pub rows: Vec<R>,
    pub range: DateRange,
}

/// One time slot of a chart. `date` is the bucket start in epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartBucket {
    pub date: i64,
    pub values: Vec<f64>,
}
