use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc, Weekday};
use mq_types::{
    config_error, CompanyOverview, HistoricalPoint, MqResult, QuoteSnapshot, UpstreamError,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

/// Upstream supplier of quotes, daily series and company overviews
#[async_trait]
pub trait QuoteSource: Send + Sync + std::fmt::Debug {
    /// Get provider name
    fn name(&self) -> &str;

    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, UpstreamError>;

    /// Full daily series, oldest first
    async fn fetch_historical_series(
        &self,
        symbol: &str,
    ) -> Result<Vec<HistoricalPoint>, UpstreamError>;

    async fn fetch_overview(&self, symbol: &str) -> Result<CompanyOverview, UpstreamError>;

    /// Get provider configuration
    fn config(&self) -> serde_json::Value;
}

/// Alpha Vantage HTTP quote source
#[derive(Debug)]
pub struct AlphaVantageSource {
    pub name: String,
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AlphaVantageSource {
    pub fn new(base_url: &str, api_key: &str) -> MqResult<Self> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, timeout: Duration) -> MqResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| config_error!("failed to build HTTP client: {}", e))?;

        Ok(Self {
            name: "Alpha Vantage".to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    async fn query(
        &self,
        function: &str,
        symbol: &str,
        extra: &[(&str, &str)],
    ) -> Result<Value, UpstreamError> {
        tracing::debug!(function, symbol, "Requesting Alpha Vantage");

        let mut params: Vec<(&str, &str)> = vec![
            ("function", function),
            ("symbol", symbol),
            ("apikey", self.api_key.as_str()),
        ];
        params.extend_from_slice(extra);

        let response = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| UpstreamError::Request {
                symbol: symbol.to_string(),
                message: e.without_url().to_string(),
            })?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                symbol: symbol.to_string(),
                status: response.status().as_u16(),
            });
        }

        let json: Value = response.json().await.map_err(|e| UpstreamError::Parse {
            symbol: symbol.to_string(),
            message: format!("Failed to parse JSON response: {}", e.without_url()),
        })?;

        check_api_errors(symbol, &json)?;
        Ok(json)
    }
}

#[async_trait]
impl QuoteSource for AlphaVantageSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, UpstreamError> {
        let json = self.query("GLOBAL_QUOTE", symbol, &[]).await?;
        parse_global_quote(symbol, &json)
    }

    async fn fetch_historical_series(
        &self,
        symbol: &str,
    ) -> Result<Vec<HistoricalPoint>, UpstreamError> {
        let json = self
            .query("TIME_SERIES_DAILY", symbol, &[("outputsize", "full")])
            .await?;
        let points = parse_daily_series(symbol, &json)?;

        tracing::info!(symbol, points = points.len(), "Retrieved daily series from Alpha Vantage");
        Ok(points)
    }

    async fn fetch_overview(&self, symbol: &str) -> Result<CompanyOverview, UpstreamError> {
        let json = self.query("OVERVIEW", symbol, &[]).await?;
        parse_overview(symbol, &json)
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "alpha_vantage",
            "base_url": self.base_url,
            "api_key_set": !self.api_key.is_empty()
        })
    }
}

/// Map Alpha Vantage's in-band error payloads to errors.
pub fn check_api_errors(symbol: &str, json: &Value) -> Result<(), UpstreamError> {
    if let Some(error) = json.get("Error Message") {
        return Err(UpstreamError::Api {
            symbol: symbol.to_string(),
            message: error.as_str().unwrap_or_default().to_string(),
        });
    }

    // Free-tier throttling arrives as "Note" (older) or "Information" (newer).
    for key in ["Note", "Information"] {
        if let Some(note) = json.get(key) {
            return Err(UpstreamError::RateLimited {
                message: note.as_str().unwrap_or_default().to_string(),
            });
        }
    }

    Ok(())
}

fn parse_error(symbol: &str, message: String) -> UpstreamError {
    UpstreamError::Parse {
        symbol: symbol.to_string(),
        message,
    }
}

fn object<'a>(
    symbol: &str,
    json: &'a Value,
    key: &str,
) -> Result<&'a Map<String, Value>, UpstreamError> {
    json.get(key)
        .ok_or_else(|| parse_error(symbol, format!("Missing '{}' in response", key)))?
        .as_object()
        .ok_or_else(|| parse_error(symbol, format!("'{}' is not an object", key)))
}

fn string_field<'a>(
    symbol: &str,
    data: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, UpstreamError> {
    data.get(field)
        .ok_or_else(|| parse_error(symbol, format!("Missing field '{}'", field)))?
        .as_str()
        .ok_or_else(|| parse_error(symbol, format!("Field '{}' is not a string", field)))
}

fn decimal_field(
    symbol: &str,
    data: &Map<String, Value>,
    field: &str,
) -> Result<Decimal, UpstreamError> {
    let value_str = string_field(symbol, data, field)?;
    Decimal::from_str(value_str.trim()).map_err(|e| {
        parse_error(
            symbol,
            format!("Failed to parse {} value '{}': {}", field, value_str, e),
        )
    })
}

/// Parse a `GLOBAL_QUOTE` payload. The percent field carries a `%` suffix.
pub fn parse_global_quote(symbol: &str, json: &Value) -> Result<QuoteSnapshot, UpstreamError> {
    let quote = object(symbol, json, "Global Quote")?;
    if quote.is_empty() {
        return Err(UpstreamError::Api {
            symbol: symbol.to_string(),
            message: "no quote returned for symbol".to_string(),
        });
    }

    let price = decimal_field(symbol, quote, "05. price")?;
    let change = decimal_field(symbol, quote, "09. change")?;

    let percent_str = string_field(symbol, quote, "10. change percent")?;
    let trimmed = percent_str.trim().trim_end_matches('%');
    let change_percent = Decimal::from_str(trimmed).map_err(|e| {
        parse_error(
            symbol,
            format!("Failed to parse change percent '{}': {}", percent_str, e),
        )
    })?;

    Ok(QuoteSnapshot::new(price, change, change_percent))
}

/// Parse a `TIME_SERIES_DAILY` payload into points sorted oldest first.
pub fn parse_daily_series(
    symbol: &str,
    json: &Value,
) -> Result<Vec<HistoricalPoint>, UpstreamError> {
    let time_series = object(symbol, json, "Time Series (Daily)")?;

    let mut points = Vec::with_capacity(time_series.len());
    for (date_str, data) in time_series {
        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|e| {
            parse_error(symbol, format!("Failed to parse date '{}': {}", date_str, e))
        })?;

        let data_obj = data
            .as_object()
            .ok_or_else(|| parse_error(symbol, format!("Data for {} is not an object", date_str)))?;

        let volume_str = string_field(symbol, data_obj, "5. volume")?;
        let volume = volume_str.trim().parse::<u64>().map_err(|e| {
            parse_error(
                symbol,
                format!("Failed to parse volume '{}' on {}: {}", volume_str, date_str, e),
            )
        })?;

        points.push(HistoricalPoint {
            date,
            open: decimal_field(symbol, data_obj, "1. open")?,
            high: decimal_field(symbol, data_obj, "2. high")?,
            low: decimal_field(symbol, data_obj, "3. low")?,
            close: decimal_field(symbol, data_obj, "4. close")?,
            volume,
        });
    }

    points.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(points)
}

fn optional_text(data: &Map<String, Value>, field: &str) -> String {
    data.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// Alpha Vantage reports unavailable metrics as "None" or "-".
fn optional_decimal(data: &Map<String, Value>, field: &str) -> Option<Decimal> {
    let raw = data.get(field)?.as_str()?.trim();
    match raw {
        "" | "None" | "-" => None,
        value => Decimal::from_str(value).ok(),
    }
}

/// Parse an `OVERVIEW` payload.
pub fn parse_overview(symbol: &str, json: &Value) -> Result<CompanyOverview, UpstreamError> {
    let data = json
        .as_object()
        .ok_or_else(|| parse_error(symbol, "Overview is not an object".to_string()))?;

    if data.get("Symbol").is_none() {
        return Err(UpstreamError::Api {
            symbol: symbol.to_string(),
            message: "no overview returned for symbol".to_string(),
        });
    }

    Ok(CompanyOverview {
        symbol: optional_text(data, "Symbol"),
        name: optional_text(data, "Name"),
        description: optional_text(data, "Description"),
        exchange: optional_text(data, "Exchange"),
        currency: optional_text(data, "Currency"),
        country: optional_text(data, "Country"),
        sector: optional_text(data, "Sector"),
        industry: optional_text(data, "Industry"),
        market_capitalization: data
            .get("MarketCapitalization")
            .and_then(Value::as_str)
            .and_then(|v| v.trim().parse::<u64>().ok()),
        pe_ratio: optional_decimal(data, "PERatio"),
        peg_ratio: optional_decimal(data, "PEGRatio"),
        book_value: optional_decimal(data, "BookValue"),
        dividend_per_share: optional_decimal(data, "DividendPerShare"),
        dividend_yield: optional_decimal(data, "DividendYield"),
        eps: optional_decimal(data, "EPS"),
        revenue_per_share_ttm: optional_decimal(data, "RevenuePerShareTTM"),
        profit_margin: optional_decimal(data, "ProfitMargin"),
        operating_margin_ttm: optional_decimal(data, "OperatingMarginTTM"),
        return_on_assets_ttm: optional_decimal(data, "ReturnOnAssetsTTM"),
        return_on_equity_ttm: optional_decimal(data, "ReturnOnEquityTTM"),
        week_52_high: optional_decimal(data, "52WeekHigh"),
        week_52_low: optional_decimal(data, "52WeekLow"),
    })
}

#[derive(Debug, Default)]
struct StaticState {
    quotes: HashMap<String, QuoteSnapshot>,
    series: HashMap<String, Vec<HistoricalPoint>>,
    overviews: HashMap<String, CompanyOverview>,
    failing: HashSet<String>,
    quote_calls: HashMap<String, usize>,
    series_calls: HashMap<String, usize>,
}

/// In-memory quote source for tests and demo runs.
///
/// Data can be swapped at any time through `&self`; every fetch is counted
/// per symbol. Symbols marked failing return an upstream error.
#[derive(Debug)]
pub struct StaticQuoteSource {
    pub name: String,
    latency: Option<Duration>,
    state: Mutex<StaticState>,
}

impl StaticQuoteSource {
    pub fn new() -> Self {
        Self {
            name: "Static Quote Source".to_string(),
            latency: None,
            state: Mutex::new(StaticState::default()),
        }
    }

    /// Deterministic quotes and ten years of weekday bars for `symbols`.
    pub fn sample<S: AsRef<str>>(symbols: &[S]) -> Self {
        let source = Self::new();
        let today = Utc::now().date_naive();

        for (i, symbol) in symbols.iter().enumerate() {
            let symbol = symbol.as_ref();
            // Simple PRNG seeded per symbol
            let mut rng_state = 12345u64.wrapping_add(i as u64 * 7919);
            let mut cents: i64 = 5_000 + (i as i64 * 3_700) % 45_000;

            let mut series = Vec::new();
            let mut date = today - ChronoDuration::days(3653);
            while date <= today {
                if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                    rng_state = rng_state.wrapping_mul(1103515245).wrapping_add(12345);
                    let step = ((rng_state >> 16) % 201) as i64 - 100; // ±1.00
                    let open = cents;
                    cents = (cents + step).max(100);
                    let high = open.max(cents) + 25;
                    let low = (open.min(cents) - 25).max(1);

                    series.push(HistoricalPoint::new(
                        date,
                        Decimal::new(open, 2),
                        Decimal::new(high, 2),
                        Decimal::new(low, 2),
                        Decimal::new(cents, 2),
                        1_000_000 + (rng_state >> 40) % 9_000_000,
                    ));
                }
                date += ChronoDuration::days(1);
            }

            let (last, prev) = match series.as_slice() {
                [.., prev, last] => (last.close, prev.close),
                [only] => (only.close, only.open),
                [] => (Decimal::new(cents, 2), Decimal::new(cents, 2)),
            };
            let change = last - prev;
            let change_percent = if prev.is_zero() {
                Decimal::ZERO
            } else {
                (change / prev * Decimal::ONE_HUNDRED).round_dp(4)
            };

            source.set_quote(symbol, QuoteSnapshot::new(last, change, change_percent));
            source.set_series(symbol, series);
        }

        source
    }

    pub fn with_quote(self, symbol: &str, snapshot: QuoteSnapshot) -> Self {
        self.set_quote(symbol, snapshot);
        self
    }

    pub fn with_series(self, symbol: &str, points: Vec<HistoricalPoint>) -> Self {
        self.set_series(symbol, points);
        self
    }

    pub fn with_overview(self, overview: CompanyOverview) -> Self {
        self.state
            .lock()
            .overviews
            .insert(overview.symbol.clone(), overview);
        self
    }

    /// Delay applied to every fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_quote(&self, symbol: &str, snapshot: QuoteSnapshot) {
        self.state.lock().quotes.insert(symbol.to_string(), snapshot);
    }

    pub fn set_series(&self, symbol: &str, points: Vec<HistoricalPoint>) {
        self.state.lock().series.insert(symbol.to_string(), points);
    }

    pub fn fail_symbol(&self, symbol: &str) {
        self.state.lock().failing.insert(symbol.to_string());
    }

    pub fn recover_symbol(&self, symbol: &str) {
        self.state.lock().failing.remove(symbol);
    }

    pub fn quote_calls(&self, symbol: &str) -> usize {
        self.state.lock().quote_calls.get(symbol).copied().unwrap_or(0)
    }

    pub fn total_quote_calls(&self) -> usize {
        self.state.lock().quote_calls.values().sum()
    }

    pub fn series_calls(&self, symbol: &str) -> usize {
        self.state.lock().series_calls.get(symbol).copied().unwrap_or(0)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn unavailable(symbol: &str, what: &str) -> UpstreamError {
        UpstreamError::Api {
            symbol: symbol.to_string(),
            message: format!("no {} available", what),
        }
    }

    fn simulated_failure(symbol: &str) -> UpstreamError {
        UpstreamError::Request {
            symbol: symbol.to_string(),
            message: "simulated upstream failure".to_string(),
        }
    }
}

impl Default for StaticQuoteSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuoteSource for StaticQuoteSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, UpstreamError> {
        {
            let mut state = self.state.lock();
            *state.quote_calls.entry(symbol.to_string()).or_insert(0) += 1;
        }
        self.simulate_latency().await;

        let state = self.state.lock();
        if state.failing.contains(symbol) {
            return Err(Self::simulated_failure(symbol));
        }
        state
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| Self::unavailable(symbol, "quote"))
    }

    async fn fetch_historical_series(
        &self,
        symbol: &str,
    ) -> Result<Vec<HistoricalPoint>, UpstreamError> {
        {
            let mut state = self.state.lock();
            *state.series_calls.entry(symbol.to_string()).or_insert(0) += 1;
        }
        self.simulate_latency().await;

        let state = self.state.lock();
        if state.failing.contains(symbol) {
            return Err(Self::simulated_failure(symbol));
        }
        state
            .series
            .get(symbol)
            .cloned()
            .ok_or_else(|| Self::unavailable(symbol, "daily series"))
    }

    async fn fetch_overview(&self, symbol: &str) -> Result<CompanyOverview, UpstreamError> {
        self.simulate_latency().await;

        let state = self.state.lock();
        if state.failing.contains(symbol) {
            return Err(Self::simulated_failure(symbol));
        }
        state
            .overviews
            .get(symbol)
            .cloned()
            .ok_or_else(|| Self::unavailable(symbol, "overview"))
    }

    fn config(&self) -> serde_json::Value {
        let state = self.state.lock();
        let mut symbols: Vec<&String> = state.quotes.keys().collect();
        symbols.sort();

        serde_json::json!({
            "type": "static",
            "symbols": symbols,
            "latency_ms": self.latency.map(|l| l.as_millis() as u64)
        })
    }
}
