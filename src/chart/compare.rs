use super::ChartBucket;
use serde::Serialize;
use std::collections::BTreeMap;

/// Values of one current bucket next to the bucket at the same index in the
/// comparison period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonMapping {
    pub current_date: i64,
    pub compare_date: i64,
    pub current_values: BTreeMap<String, f64>,
    pub compare_values: BTreeMap<String, f64>,
}

/// Pair buckets index by index. `categories[i]` names `values[i]` of each
/// bucket; a missing value reads as 0.
///
/// Returns `None` when the two series differ in length.
pub fn align(
    current: &[ChartBucket],
    compare: &[ChartBucket],
    categories: &[String],
) -> Option<Vec<ComparisonMapping>> {
    if current.len() != compare.len() {
        tracing::debug!(
            current = current.len(),
            compare = compare.len(),
            "Comparison period has a different bucket count, dropping it"
        );
        return None;
    }

    let by_category = |bucket: &ChartBucket| -> BTreeMap<String, f64> {
        categories
            .iter()
            .enumerate()
            .map(|(i, category)| {
                (
                    category.clone(),
                    bucket.values.get(i).copied().unwrap_or(0.0),
                )
            })
            .collect()
    };

    Some(
        current
            .iter()
            .zip(compare)
            .map(|(now, then)| ComparisonMapping {
                current_date: now.date,
                compare_date: then.date,
                current_values: by_category(now),
                compare_values: by_category(then),
            })
            .collect(),
    )
}
