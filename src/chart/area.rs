use super::compare::{align, ComparisonMapping};
use super::{ChartBucket, ComparePeriod, DateRange, RawPoint};
use crate::granularity::Granularity;
use serde::Serialize;
use std::collections::HashMap;

/// Single-series time chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AreaChart {
    /// One value per bucket, or `[current, compare]` when a comparison
    /// period was aligned.
    pub data: Vec<ChartBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison_map: Option<Vec<ComparisonMapping>>,
}

/// Every bucket start in `range`, in order, as epoch millis.
///
/// Both endpoints are floored to the granularity first, so the keys line up
/// with the truncated dates the store groups by even when `range` starts
/// mid-bucket. An inverted range yields no buckets.
pub fn bucket_keys(range: &DateRange, granularity: Granularity) -> Vec<i64> {
    let start = granularity.floor(range.start);
    let end = granularity.floor(range.end);
    let step = granularity.step_millis();

    let mut keys = Vec::new();
    let mut at = start;
    while at <= end {
        keys.push(at);
        at += step;
    }
    keys
}

/// Zero-filled `(bucket, value)` pairs. Rows whose date is not exactly a
/// bucket start are ignored; for duplicate dates the last row wins.
pub fn bucket_series(rows: &[RawPoint], granularity: Granularity, range: &DateRange) -> Vec<(i64, f64)> {
    let grouped: HashMap<i64, f64> = rows
        .iter()
        .map(|row| (row.date.timestamp_millis(), row.value))
        .collect();

    bucket_keys(range, granularity)
        .into_iter()
        .map(|key| (key, grouped.get(&key).copied().unwrap_or(0.0)))
        .collect()
}

/// Present one series, optionally aligned with a comparison period.
///
/// The comparison is dropped when the two periods produce a different number
/// of buckets.
pub fn to_area_chart(
    series: &str,
    rows: &[RawPoint],
    granularity: Granularity,
    range: &DateRange,
    compare: Option<&ComparePeriod<RawPoint>>,
) -> AreaChart {
    let mut data: Vec<ChartBucket> = bucket_series(rows, granularity, range)
        .into_iter()
        .map(|(date, value)| ChartBucket {
            date,
            values: vec![value],
        })
        .collect();

    let Some(compare) = compare else {
        return AreaChart {
            data,
            comparison_map: None,
        };
    };

    let compare_data: Vec<ChartBucket> = bucket_series(&compare.rows, granularity, &compare.range)
        .into_iter()
        .map(|(date, value)| ChartBucket {
            date,
            values: vec![value],
        })
        .collect();

    let comparison_map = align(&data, &compare_data, &[series.to_string()]);
    if comparison_map.is_some() {
        for (bucket, previous) in data.iter_mut().zip(&compare_data) {
            bucket.values.extend_from_slice(&previous.values);
        }
    }

    AreaChart {
        data,
        comparison_map,
    }
}
