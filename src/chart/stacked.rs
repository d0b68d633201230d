use super::area::bucket_keys;
use super::compare::{align, ComparisonMapping};
use super::{ChartBucket, ComparePeriod, DateRange, RawCategoryPoint};
use crate::granularity::Granularity;
use serde::Serialize;
use std::collections::HashMap;

/// Multi-category time chart. `values[i]` of every bucket belongs to
/// `categories[i]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackedChart {
    pub data: Vec<ChartBucket>,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison_map: Option<Vec<ComparisonMapping>>,
}

/// Distinct categories in order of first appearance.
fn distinct_categories(rows: &[RawCategoryPoint]) -> Vec<String> {
    let mut seen = Vec::new();
    for row in rows {
        if !seen.contains(&row.category) {
            seen.push(row.category.clone());
        }
    }
    seen
}

fn pivot(
    rows: &[RawCategoryPoint],
    categories: &[String],
    granularity: Granularity,
    range: &DateRange,
) -> Vec<ChartBucket> {
    let mut grouped: HashMap<(i64, &str), f64> = HashMap::new();
    for row in rows {
        grouped.insert((row.date.timestamp_millis(), row.category.as_str()), row.value);
    }

    bucket_keys(range, granularity)
        .into_iter()
        .map(|date| ChartBucket {
            date,
            values: categories
                .iter()
                .map(|category| {
                    grouped
                        .get(&(date, category.as_str()))
                        .copied()
                        .unwrap_or(0.0)
                })
                .collect(),
        })
        .collect()
}

/// Present a breakdown over time.
///
/// Without an explicit `categories` list, every category seen in `rows` is
/// charted in order of first appearance. The comparison period is pivoted on
/// the same categories and dropped when its bucket count differs.
pub fn to_stacked_chart(
    rows: &[RawCategoryPoint],
    categories: Option<Vec<String>>,
    granularity: Granularity,
    range: &DateRange,
    compare: Option<&ComparePeriod<RawCategoryPoint>>,
) -> StackedChart {
    let categories = categories.unwrap_or_else(|| distinct_categories(rows));
    let data = pivot(rows, &categories, granularity, range);

    let comparison_map = compare.and_then(|compare| {
        let compare_data = pivot(&compare.rows, &categories, granularity, &compare.range);
        align(&data, &compare_data, &categories)
    });

    StackedChart {
        data,
        categories,
        comparison_map,
    }
}

/// Distinct categories ordered by their total value, largest first. Ties keep
/// first-appearance order.
pub fn sorted_categories(rows: &[RawCategoryPoint]) -> Vec<String> {
    let mut totals: HashMap<&str, f64> = HashMap::new();
    for row in rows {
        *totals.entry(row.category.as_str()).or_insert(0.0) += row.value;
    }

    let mut categories = distinct_categories(rows);
    categories.sort_by(|a, b| {
        let total = |c: &String| totals.get(c.as_str()).copied().unwrap_or(0.0);
        total(b).total_cmp(&total(a))
    });
    categories
}
