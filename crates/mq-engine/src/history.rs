//! Historical window filtering over a record's daily series.

use chrono::NaiveDate;
use mq_types::{HistoricalPoint, HistoryRange};

/// Points with `today - range <= date <= today`, ascending by date.
pub fn filter_range(
    points: &[HistoricalPoint],
    range: HistoryRange,
    today: NaiveDate,
) -> Vec<HistoricalPoint> {
    let (start, end) = range.window(today);

    let mut selected: Vec<HistoricalPoint> = points
        .iter()
        .filter(|p| p.date >= start && p.date <= end)
        .cloned()
        .collect();
    selected.sort_by(|a, b| a.date.cmp(&b.date));
    selected
}
