use chrono::{Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::MqError;

/// Point-in-time quote fields as delivered by a quote source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub price: Decimal,
    pub change: Decimal,
    pub change_percent: Decimal,
}

impl QuoteSnapshot {
    pub fn new(price: Decimal, change: Decimal, change_percent: Decimal) -> Self {
        Self {
            price,
            change,
            change_percent,
        }
    }
}

/// One daily OHLCV observation owned by a [`QuoteRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

impl HistoricalPoint {
    pub fn new(
        date: NaiveDate,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: u64,
    ) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Cached quote for a tracked symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub symbol: String,
    pub display_name: Option<String>,
    pub price: Decimal,
    pub change: Decimal,
    pub change_percent: Decimal,
    pub historical_series: Vec<HistoricalPoint>,
}

impl QuoteRecord {
    pub fn new(symbol: &str, snapshot: QuoteSnapshot) -> Self {
        Self {
            symbol: symbol.to_string(),
            display_name: None,
            price: snapshot.price,
            change: snapshot.change,
            change_percent: snapshot.change_percent,
            historical_series: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> QuoteSnapshot {
        QuoteSnapshot::new(self.price, self.change, self.change_percent)
    }
}

/// Incoming write for the quote store.
///
/// `display_name` and `historical_series` are only applied when `Some`; an
/// existing record keeps its current values otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteUpsert {
    pub symbol: String,
    pub snapshot: QuoteSnapshot,
    pub display_name: Option<String>,
    pub historical_series: Option<Vec<HistoricalPoint>>,
}

impl QuoteUpsert {
    pub fn prices(symbol: &str, snapshot: QuoteSnapshot) -> Self {
        Self {
            symbol: symbol.to_string(),
            snapshot,
            display_name: None,
            historical_series: None,
        }
    }

    pub fn with_display_name(mut self, name: Option<&str>) -> Self {
        self.display_name = name.map(str::to_string);
        self
    }

    pub fn with_history(mut self, points: Vec<HistoricalPoint>) -> Self {
        self.historical_series = Some(points);
        self
    }

    /// Record created when no cached entry exists yet.
    pub fn into_record(self) -> QuoteRecord {
        let mut record = QuoteRecord::new(&self.symbol, self.snapshot);
        record.display_name = self.display_name;
        record.historical_series = normalize_series(self.historical_series.unwrap_or_default());
        record
    }
}

/// Merge an incoming write into an existing record.
///
/// Price fields always come from `incoming`. The symbol never changes.
pub fn merge_record(existing: &QuoteRecord, incoming: QuoteUpsert) -> QuoteRecord {
    QuoteRecord {
        symbol: existing.symbol.clone(),
        display_name: incoming.display_name.or_else(|| existing.display_name.clone()),
        price: incoming.snapshot.price,
        change: incoming.snapshot.change,
        change_percent: incoming.snapshot.change_percent,
        historical_series: match incoming.historical_series {
            Some(points) => normalize_series(points),
            None => existing.historical_series.clone(),
        },
    }
}

/// Sort ascending by date and keep the last point for any repeated date.
pub fn normalize_series(mut points: Vec<HistoricalPoint>) -> Vec<HistoricalPoint> {
    // Stable sort keeps input order among equal dates, so the last one wins below.
    points.sort_by(|a, b| a.date.cmp(&b.date));
    let mut out: Vec<HistoricalPoint> = Vec::with_capacity(points.len());
    for point in points {
        match out.last_mut() {
            Some(last) if last.date == point.date => *last = point,
            _ => out.push(point),
        }
    }
    out
}

/// Relative look-back window for historical queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryRange {
    OneYear,
    FiveYears,
    TenYears,
}

impl HistoryRange {
    pub fn years(&self) -> u32 {
        match self {
            HistoryRange::OneYear => 1,
            HistoryRange::FiveYears => 5,
            HistoryRange::TenYears => 10,
        }
    }

    /// Inclusive `[start, today]` window. Feb 29 maps to Feb 28 when the
    /// target year has no leap day.
    pub fn window(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = today
            .checked_sub_months(Months::new(12 * self.years()))
            .unwrap_or(NaiveDate::MIN);
        (start, today)
    }
}

impl FromStr for HistoryRange {
    type Err = MqError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "1y" => Ok(HistoryRange::OneYear),
            "5y" => Ok(HistoryRange::FiveYears),
            "10y" => Ok(HistoryRange::TenYears),
            other => Err(MqError::InvalidArgument(format!(
                "unrecognized range token '{}', expected one of 1y, 5y, 10y",
                other
            ))),
        }
    }
}

impl fmt::Display for HistoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HistoryRange::OneYear => "1y",
            HistoryRange::FiveYears => "5y",
            HistoryRange::TenYears => "10y",
        };
        write!(f, "{}", s)
    }
}

/// Company descriptive and fundamental fields for ad-hoc stock lookups.
/// Numeric fields the provider reports as unavailable are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompanyOverview {
    pub symbol: String,
    pub name: String,
    pub description: String,
    pub exchange: String,
    pub currency: String,
    pub country: String,
    pub sector: String,
    pub industry: String,
    pub market_capitalization: Option<u64>,
    pub pe_ratio: Option<Decimal>,
    pub peg_ratio: Option<Decimal>,
    pub book_value: Option<Decimal>,
    pub dividend_per_share: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub eps: Option<Decimal>,
    pub revenue_per_share_ttm: Option<Decimal>,
    pub profit_margin: Option<Decimal>,
    pub operating_margin_ttm: Option<Decimal>,
    pub return_on_assets_ttm: Option<Decimal>,
    pub return_on_equity_ttm: Option<Decimal>,
    pub week_52_high: Option<Decimal>,
    pub week_52_low: Option<Decimal>,
}

/// Overview plus current quote for a single, untracked stock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDetail {
    pub overview: CompanyOverview,
    pub quote: QuoteSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn point(date: &str, close: Decimal) -> HistoricalPoint {
        HistoricalPoint::new(
            NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            close,
            close,
            close,
            close,
            1_000,
        )
    }

    fn existing_sector() -> QuoteRecord {
        QuoteRecord {
            symbol: "XLK".to_string(),
            display_name: Some("Technology".to_string()),
            price: dec!(200.10),
            change: dec!(1.00),
            change_percent: dec!(0.5),
            historical_series: vec![point("2024-01-02", dec!(199.5))],
        }
    }

    #[test]
    fn test_merge_keeps_history_and_name_for_price_update() {
        let existing = existing_sector();
        let incoming = QuoteUpsert::prices("XLK", QuoteSnapshot::new(dec!(210.25), dec!(10.15), dec!(5.0724)));

        let merged = merge_record(&existing, incoming);

        assert_eq!(merged.price, dec!(210.25));
        assert_eq!(merged.change, dec!(10.15));
        assert_eq!(merged.change_percent, dec!(5.0724));
        assert_eq!(merged.display_name.as_deref(), Some("Technology"));
        assert_eq!(merged.historical_series, existing.historical_series);
    }

    #[test]
    fn test_merge_replaces_history_when_supplied() {
        let existing = existing_sector();
        let incoming = QuoteUpsert::prices("XLK", existing.snapshot())
            .with_history(vec![point("2024-02-01", dec!(205)), point("2024-01-31", dec!(204))]);

        let merged = merge_record(&existing, incoming);

        let dates: Vec<String> = merged
            .historical_series
            .iter()
            .map(|p| p.date.to_string())
            .collect();
        assert_eq!(dates, vec!["2024-01-31", "2024-02-01"]);
    }

    #[test]
    fn test_normalize_series_last_duplicate_wins() {
        let series = normalize_series(vec![
            point("2024-01-03", dec!(1)),
            point("2024-01-02", dec!(2)),
            point("2024-01-03", dec!(3)),
        ]);

        assert_eq!(series.len(), 2);
        assert_eq!(series[1].close, dec!(3));
    }

    #[test]
    fn test_decimal_precision_survives_serde() {
        let record = QuoteRecord::new("SPY", QuoteSnapshot::new(dec!(512.3400), dec!(-0.0100), dec!(-0.0020)));
        let json = serde_json::to_string(&record).unwrap();
        let back: QuoteRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(back.price.to_string(), "512.3400");
        assert_eq!(back.change_percent.to_string(), "-0.0020");
    }

    #[test]
    fn test_history_range_tokens() {
        assert_eq!("1y".parse::<HistoryRange>().unwrap(), HistoryRange::OneYear);
        assert_eq!("5y".parse::<HistoryRange>().unwrap(), HistoryRange::FiveYears);
        assert_eq!("10y".parse::<HistoryRange>().unwrap(), HistoryRange::TenYears);
        assert!(matches!("3y".parse::<HistoryRange>(), Err(MqError::InvalidArgument(_))));
        assert!("1Y".parse::<HistoryRange>().is_err());
    }

    #[test]
    fn test_history_range_window_leap_day() {
        let today = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let (start, end) = HistoryRange::OneYear.window(today);

        assert_eq!(start, NaiveDate::from_ymd_opt(2023, 2, 28).unwrap());
        assert_eq!(end, today);

        let (start, _) = HistoryRange::TenYears.window(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap());
        assert_eq!(start, NaiveDate::from_ymd_opt(2015, 6, 15).unwrap());
    }
}
