use serde::{Deserialize, Serialize};

/// One `(dimension value, total)` row from a breakdown query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownRow {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PieSlice {
    pub name: String,
    /// `[current]`, or `[current, compare]` with a comparison period.
    pub value: Vec<f64>,
    /// Share of the current total, 0 to 100.
    pub percentage: f64,
}

/// Slices in row order. Compare values are matched by name and read as 0 when
/// the comparison period lacks that name.
pub fn to_pie_chart(rows: &[BreakdownRow], compare: Option<&[BreakdownRow]>) -> Vec<PieSlice> {
    let total: f64 = rows.iter().map(|row| row.value).sum();
    let total = if total > 0.0 { total } else { 1.0 };

    rows.iter()
        .map(|row| {
            let mut value = vec![row.value];
            if let Some(compare) = compare {
                value.push(
                    compare
                        .iter()
                        .find(|other| other.name == row.name)
                        .map_or(0.0, |other| other.value),
                );
            }
            PieSlice {
                name: row.name.clone(),
                value,
                percentage: 100.0 * row.value / total,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, value: f64) -> BreakdownRow {
        BreakdownRow {
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn test_percentages() {
        let slices = to_pie_chart(&[row("desktop", 75.0), row("mobile", 25.0)], None);
        assert_eq!(slices.len(), 2);
        assert!((slices[0].percentage - 75.0).abs() < f64::EPSILON);
        assert_eq!(slices[1].value, vec![25.0]);
    }

    #[test]
    fn test_zero_total() {
        let slices = to_pie_chart(&[row("desktop", 0.0)], None);
        assert!(slices[0].percentage.abs() < f64::EPSILON);
    }

    #[test]
    fn test_compare_matched_by_name() {
        let compare = [row("mobile", 10.0), row("tablet", 3.0)];
        let slices = to_pie_chart(&[row("desktop", 5.0), row("mobile", 5.0)], Some(&compare));
        assert_eq!(slices[0].value, vec![5.0, 0.0]);
        assert_eq!(slices[1].value, vec![5.0, 10.0]);
        assert!((slices[1].percentage - 50.0).abs() < f64::EPSILON);
    }
}
