//! Conversion and drop-off analysis of a funnel.
//!
//! Visitor counts are cumulative: `visitors[i]` is the number of visitors who
//! reached step `i`, not the number who stopped there.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisitorCount {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStep {
    pub page: String,
    pub visitors: u64,
    /// Share of the widest step.
    pub visitors_ratio: f64,
    /// Visitors lost since the previous step. Negative when a later step has
    /// more visitors than an earlier one.
    pub dropoff_count: i64,
    pub dropoff_ratio: f64,
    /// `[previous page, page]`; the first step's previous page is empty.
    pub page_step: [String; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentedFunnel {
    pub name: String,
    pub visitor_count: VisitorCount,
    pub steps: Vec<FunnelStep>,
    /// The step with the highest drop-off ratio; the earliest wins a tie.
    pub biggest_drop_off: Option<FunnelStep>,
    pub conversion_rate: f64,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    numerator as f64 / denominator as f64
}

/// Analyze a funnel from its step pages and per-step visitor counts.
///
/// A page without a count is treated as 0 visitors. With no counts at all,
/// both min and max fall back to 1, so an empty funnel converts at 100%.
pub fn analyze_funnel(name: &str, pages: &[String], visitors: &[u64]) -> PresentedFunnel {
    let visitor_count = VisitorCount {
        min: visitors.iter().copied().min().unwrap_or(1),
        max: visitors.iter().copied().max().unwrap_or(1),
    };
    let max = visitor_count.max.max(1);

    let mut steps = Vec::with_capacity(pages.len());
    let mut previous = (String::new(), visitor_count.max);
    for (i, page) in pages.iter().enumerate() {
        let count = visitors.get(i).copied().unwrap_or(0);
        let (previous_page, previous_count) = &previous;

        let dropoff_ratio = if *previous_count == 0 {
            0.0
        } else {
            1.0 - ratio(count, *previous_count)
        };
        let dropoff_count = i64::try_from(*previous_count)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(count).unwrap_or(i64::MAX));

        steps.push(FunnelStep {
            page: page.clone(),
            visitors: count,
            visitors_ratio: ratio(count, max),
            dropoff_count,
            dropoff_ratio,
            page_step: [previous_page.clone(), page.clone()],
        });
        previous = (page.clone(), count);
    }

    let biggest_drop_off = steps
        .iter()
        .fold(None::<&FunnelStep>, |best, step| match best {
            Some(best) if step.dropoff_ratio <= best.dropoff_ratio => Some(best),
            _ => Some(step),
        })
        .cloned();

    PresentedFunnel {
        name: name.to_string(),
        visitor_count,
        conversion_rate: ratio(visitor_count.min, max),
        steps,
        biggest_drop_off,
    }
}
