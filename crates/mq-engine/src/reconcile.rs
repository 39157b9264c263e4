//! Cache reconciliation engine.
//!
//! Owns the policy that decides, per tracked symbol, whether to serve the
//! cached record, fetch-and-populate on a miss, or overwrite on a scheduled
//! refresh. Every find/fetch/write sequence for a symbol runs under that
//! symbol's lock, so concurrent readers and refreshers never interleave writes
//! for the same key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mq_data::{QuoteSource, QuoteStore, SymbolCatalog, UpsertKind};
use mq_types::{
    internal_error, HistoricalPoint, HistoryRange, MqError, MqResult, QuoteRecord, QuoteSnapshot,
    QuoteUpsert, StockDetail,
};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::history::filter_range;

/// Which refresh job produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshJob {
    Prices,
    Historical,
}

/// What a refresh did to one symbol's record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolFailure {
    pub symbol: String,
    pub error: String,
}

/// Summary of one refresh run, in catalog order
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub run_id: Uuid,
    pub job: RefreshJob,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub updated: Vec<String>,
    pub created: Vec<String>,
    pub failed: Vec<SymbolFailure>,
}

impl RefreshReport {
    fn begin(job: RefreshJob) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            job,
            started_at: now,
            finished_at: now,
            updated: Vec::new(),
            created: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.updated.len() + self.created.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    source: Arc<dyn QuoteSource>,
    store: Arc<QuoteStore>,
    catalog: Arc<SymbolCatalog>,
    symbol_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    fetch_limit: Arc<Semaphore>,
}

impl ReconciliationEngine {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        store: Arc<QuoteStore>,
        catalog: SymbolCatalog,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            source,
            store,
            catalog: Arc::new(catalog),
            symbol_locks: Arc::new(DashMap::new()),
            fetch_limit: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
        }
    }

    pub fn catalog(&self) -> &SymbolCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &QuoteStore {
        &self.store
    }

    // -- read-with-populate -------------------------------------------------

    /// Tracked indexes in catalog order. Cached records are returned as-is.
    pub async fn get_all_indexes(&self) -> MqResult<Vec<QuoteRecord>> {
        let mut records = Vec::with_capacity(self.catalog.tracked_index_symbols().len());
        for symbol in self.catalog.tracked_index_symbols() {
            records.push(self.get_or_populate(symbol).await?);
        }
        Ok(records)
    }

    /// Tracked sectors in catalog order, with display names.
    pub async fn get_all_sectors(&self) -> MqResult<Vec<QuoteRecord>> {
        let mut records = Vec::with_capacity(self.catalog.tracked_sector_symbols().len());
        for symbol in self.catalog.tracked_sector_symbols().keys() {
            records.push(self.get_or_populate(symbol).await?);
        }
        Ok(records)
    }

    /// Cached record for `symbol`, fetched and stored first if absent.
    pub async fn get_or_populate(&self, symbol: &str) -> MqResult<QuoteRecord> {
        if let Some(record) = self.store.find_by_symbol(symbol)? {
            debug!(symbol = %symbol, "Cache hit");
            return Ok(record);
        }

        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;

        // A refresh may have created it while we waited.
        if let Some(record) = self.store.find_by_symbol(symbol)? {
            debug!(symbol = %symbol, "Cache populated concurrently");
            return Ok(record);
        }

        debug!(symbol = %symbol, "Cache miss, fetching quote");
        let snapshot = self.fetch_quote(symbol).await?;
        let upsert = QuoteUpsert::prices(symbol, snapshot)
            .with_display_name(self.catalog.display_name(symbol));

        let record = self.store.upsert(upsert)?;
        info!(symbol = %symbol, "Populated cache on read miss");
        Ok(record)
    }

    // -- scheduled refresh --------------------------------------------------

    /// Re-fetch every tracked symbol and write the fresh prices.
    ///
    /// One symbol failing never stops the others; failures are reported.
    pub async fn update_indexes(&self) -> MqResult<RefreshReport> {
        let mut report = RefreshReport::begin(RefreshJob::Prices);
        let symbols = self.catalog.all_tracked_symbols();

        let mut tasks = JoinSet::new();
        for (idx, symbol) in symbols.iter().cloned().enumerate() {
            let engine = self.clone();
            tasks.spawn(async move { (idx, engine.refresh_symbol(&symbol).await) });
        }

        for (symbol, result) in collect_in_order(tasks, symbols).await {
            match result {
                Ok(RefreshOutcome::Updated) => report.updated.push(symbol),
                Ok(RefreshOutcome::Created) => report.created.push(symbol),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Price refresh failed for symbol");
                    report.failed.push(SymbolFailure {
                        symbol,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            updated = report.updated.len(),
            created = report.created.len(),
            failed = report.failed.len(),
            "Price refresh finished"
        );
        Ok(report)
    }

    /// Fetch and write one symbol's quote. Existing records only get their
    /// price fields overwritten. The sector name goes with every write, since
    /// a concurrent `clear_all` can turn an update into an insert.
    pub async fn refresh_symbol(&self, symbol: &str) -> MqResult<RefreshOutcome> {
        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;

        let snapshot = self.fetch_quote(symbol).await?;
        let upsert = QuoteUpsert::prices(symbol, snapshot)
            .with_display_name(self.catalog.display_name(symbol));

        match self.store.upsert_with_kind(upsert)? {
            (_, UpsertKind::Updated) => Ok(RefreshOutcome::Updated),
            (_, UpsertKind::Inserted) => Ok(RefreshOutcome::Created),
        }
    }

    // -- historical refresh -------------------------------------------------

    /// Replace `symbol`'s historical series with a fresh full fetch.
    /// Returns the number of points stored.
    pub async fn update_historical_data(&self, symbol: &str) -> MqResult<usize> {
        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;

        if self.store.find_by_symbol(symbol)?.is_none() {
            return Err(MqError::not_found(symbol));
        }

        let points = {
            let _permit = self.acquire_fetch_permit().await?;
            self.source.fetch_historical_series(symbol).await?
        };
        let count = points.len();
        self.store.replace_historical_series(symbol, points)?;

        debug!(symbol = %symbol, points = count, "Historical series replaced");
        Ok(count)
    }

    /// Historical refresh over every tracked symbol, failures isolated.
    pub async fn update_all_historical_data(&self) -> MqResult<RefreshReport> {
        let mut report = RefreshReport::begin(RefreshJob::Historical);
        let symbols = self.catalog.all_tracked_symbols();

        let mut tasks = JoinSet::new();
        for (idx, symbol) in symbols.iter().cloned().enumerate() {
            let engine = self.clone();
            tasks.spawn(async move { (idx, engine.update_historical_data(&symbol).await) });
        }

        for (symbol, result) in collect_in_order(tasks, symbols).await {
            match result {
                Ok(_) => report.updated.push(symbol),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Historical refresh failed for symbol");
                    report.failed.push(SymbolFailure {
                        symbol,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            updated = report.updated.len(),
            failed = report.failed.len(),
            "Historical refresh finished"
        );
        Ok(report)
    }

    /// Cached history for `symbol` within the window named by `range_token`
    /// ("1y", "5y" or "10y"), ending today.
    pub async fn get_historical(
        &self,
        symbol: &str,
        range_token: &str,
    ) -> MqResult<Vec<HistoricalPoint>> {
        let range: HistoryRange = range_token.parse()?;

        let record = self
            .store
            .find_by_symbol(symbol)?
            .ok_or_else(|| MqError::not_found(symbol))?;

        let today = Utc::now().date_naive();
        Ok(filter_range(&record.historical_series, range, today))
    }

    /// Drop every cached record. Administrative only.
    pub async fn clear_all(&self) -> MqResult<()> {
        warn!("Clearing the entire quote cache");
        self.store.clear_all()
    }

    // -- ad-hoc lookups (never cached) ---------------------------------------

    pub async fn get_stock_quote(&self, symbol: &str) -> MqResult<QuoteSnapshot> {
        self.fetch_quote(symbol).await
    }

    pub async fn get_stock_detail(&self, symbol: &str) -> MqResult<StockDetail> {
        let _permit = self.acquire_fetch_permit().await?;
        let overview = self.source.fetch_overview(symbol).await?;
        let quote = self.source.fetch_quote(symbol).await?;
        Ok(StockDetail { overview, quote })
    }

    pub async fn get_daily_series(&self, symbol: &str) -> MqResult<Vec<HistoricalPoint>> {
        let _permit = self.acquire_fetch_permit().await?;
        Ok(self.source.fetch_historical_series(symbol).await?)
    }

    // -- internals ----------------------------------------------------------

    fn lock_for(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    async fn acquire_fetch_permit(&self) -> MqResult<SemaphorePermit<'_>> {
        self.fetch_limit
            .acquire()
            .await
            .map_err(|e| internal_error!("fetch limiter closed: {}", e))
    }

    async fn fetch_quote(&self, symbol: &str) -> MqResult<QuoteSnapshot> {
        let _permit = self.acquire_fetch_permit().await?;
        Ok(self.source.fetch_quote(symbol).await?)
    }
}

/// Drain per-symbol refresh tasks into `symbols` order. A task that panicked
/// or was cancelled yields an error for its symbol.
async fn collect_in_order<T: Send + 'static>(
    mut tasks: JoinSet<(usize, MqResult<T>)>,
    symbols: Vec<String>,
) -> Vec<(String, MqResult<T>)> {
    let mut slots: Vec<Option<MqResult<T>>> = symbols.iter().map(|_| None).collect();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, result)) => {
                if let Some(slot) = slots.get_mut(idx) {
                    *slot = Some(result);
                }
            }
            Err(e) => error!(error = %e, "Refresh task aborted"),
        }
    }

    symbols
        .into_iter()
        .zip(slots)
        .map(|(symbol, slot)| {
            let result = slot
                .unwrap_or_else(|| Err(internal_error!("refresh task for {} aborted", symbol)));
            (symbol, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_data::StaticQuoteSource;
    use mq_types::CatalogConfig;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn catalog(indexes: &[&str], sectors: &[(&str, &str)]) -> SymbolCatalog {
        SymbolCatalog::new(&CatalogConfig {
            index_symbols: indexes.iter().map(|s| s.to_string()).collect(),
            sector_symbols: sectors
                .iter()
                .map(|(s, n)| (s.to_string(), n.to_string()))
                .collect::<BTreeMap<_, _>>(),
        })
        .unwrap()
    }

    fn engine_with(source: Arc<StaticQuoteSource>, catalog: SymbolCatalog) -> ReconciliationEngine {
        let store = Arc::new(QuoteStore::open_in_memory().unwrap());
        ReconciliationEngine::new(source, store, catalog, 2)
    }

    #[tokio::test]
    async fn test_read_miss_stamps_sector_name_only() {
        let source = Arc::new(
            StaticQuoteSource::new()
                .with_quote("SPY", QuoteSnapshot::new(dec!(500), dec!(1), dec!(0.2)))
                .with_quote("XLF", QuoteSnapshot::new(dec!(40), dec!(0.1), dec!(0.25))),
        );
        let engine = engine_with(source, catalog(&["SPY"], &[("XLF", "Financials")]));

        let indexes = engine.get_all_indexes().await.unwrap();
        let sectors = engine.get_all_sectors().await.unwrap();

        assert_eq!(indexes[0].display_name, None);
        assert_eq!(sectors[0].display_name.as_deref(), Some("Financials"));
        assert_eq!(
            engine.store().find_by_symbol("XLF").unwrap().unwrap().display_name.as_deref(),
            Some("Financials")
        );
    }

    #[tokio::test]
    async fn test_read_miss_upstream_error_propagates() {
        let source = Arc::new(StaticQuoteSource::new());
        source.fail_symbol("SPY");
        let engine = engine_with(source, catalog(&["SPY"], &[]));

        let result = engine.get_all_indexes().await;
        assert!(matches!(result, Err(MqError::Upstream(_))));
        assert!(engine.store().find_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_creates_missing_and_updates_existing() {
        let source = Arc::new(
            StaticQuoteSource::new()
                .with_quote("SPY", QuoteSnapshot::new(dec!(500), dec!(1), dec!(0.2)))
                .with_quote("XLV", QuoteSnapshot::new(dec!(140), dec!(2), dec!(1.45))),
        );
        let engine = engine_with(source.clone(), catalog(&["SPY"], &[("XLV", "Healthcare")]));

        engine.get_or_populate("SPY").await.unwrap();
        source.set_quote("SPY", QuoteSnapshot::new(dec!(505.5), dec!(5.5), dec!(1.1)));

        let report = engine.update_indexes().await.unwrap();
        assert_eq!(report.job, RefreshJob::Prices);
        assert_eq!(report.updated, vec!["SPY".to_string()]);
        assert_eq!(report.created, vec!["XLV".to_string()]);
        assert!(report.is_clean());

        let spy = engine.store().find_by_symbol("SPY").unwrap().unwrap();
        assert_eq!(spy.price, dec!(505.5));
        let xlv = engine.store().find_by_symbol("XLV").unwrap().unwrap();
        assert_eq!(xlv.display_name.as_deref(), Some("Healthcare"));
    }

    #[tokio::test]
    async fn test_historical_refresh_requires_record() {
        let source = Arc::new(StaticQuoteSource::sample(&["SPY"]));
        let engine = engine_with(source.clone(), catalog(&["SPY"], &[]));

        let result = engine.update_historical_data("SPY").await;
        assert!(matches!(result, Err(MqError::NotFound { .. })));
        assert_eq!(source.series_calls("SPY"), 0);

        engine.get_or_populate("SPY").await.unwrap();
        let count = engine.update_historical_data("SPY").await.unwrap();
        assert!(count > 0);
        assert_eq!(
            engine.store().find_by_symbol("SPY").unwrap().unwrap().historical_series.len(),
            count
        );
    }

    #[tokio::test]
    async fn test_get_historical_validates_token_then_symbol() {
        let source = Arc::new(StaticQuoteSource::sample(&["SPY"]));
        let engine = engine_with(source, catalog(&["SPY"], &[]));

        assert!(matches!(
            engine.get_historical("SPY", "3y").await,
            Err(MqError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.get_historical("SPY", "1y").await,
            Err(MqError::NotFound { .. })
        ));

        engine.get_or_populate("SPY").await.unwrap();
        engine.update_historical_data("SPY").await.unwrap();

        let one = engine.get_historical("SPY", "1y").await.unwrap();
        let five = engine.get_historical("SPY", "5y").await.unwrap();
        assert!(!one.is_empty());
        assert!(five.len() > one.len());
        assert!(one.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[tokio::test]
    async fn test_stock_lookups_bypass_cache() {
        let source = Arc::new(
            StaticQuoteSource::new()
                .with_quote("IBM", QuoteSnapshot::new(dec!(190.12), dec!(0.5), dec!(0.26)))
                .with_overview(mq_types::CompanyOverview {
                    symbol: "IBM".to_string(),
                    name: "International Business Machines".to_string(),
                    ..Default::default()
                }),
        );
        let engine = engine_with(source, catalog(&["SPY"], &[]));

        let detail = engine.get_stock_detail("IBM").await.unwrap();
        assert_eq!(detail.overview.name, "International Business Machines");
        assert_eq!(detail.quote.price, dec!(190.12));
        assert_eq!(engine.get_stock_quote("IBM").await.unwrap().change, dec!(0.5));
        assert!(engine.get_daily_series("IBM").await.is_err());

        assert!(engine.store().find_by_symbol("IBM").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_all_history_isolates_missing_records() {
        let source = Arc::new(StaticQuoteSource::sample(&["SPY", "QQQ", "XLU"]));
        let engine = engine_with(source.clone(), catalog(&["SPY", "QQQ"], &[("XLU", "Utilities")]));

        engine.get_or_populate("SPY").await.unwrap();
        engine.get_or_populate("XLU").await.unwrap();

        let report = engine.update_all_historical_data().await.unwrap();
        assert_eq!(report.job, RefreshJob::Historical);
        assert_eq!(report.updated, vec!["SPY".to_string(), "XLU".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].symbol, "QQQ");
        assert_eq!(source.series_calls("QQQ"), 0);
        assert!(engine.store().find_by_symbol("QQQ").unwrap().is_none());
    }

    /// Panics on quote fetches for one symbol, delegates everything else.
    #[derive(Debug)]
    struct PanicOnQuote {
        inner: StaticQuoteSource,
        symbol: &'static str,
    }

    #[async_trait::async_trait]
    impl QuoteSource for PanicOnQuote {
        fn name(&self) -> &str {
            "panic-on-quote"
        }

        async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, mq_types::UpstreamError> {
            if symbol == self.symbol {
                panic!("quote decoder blew up for {}", symbol);
            }
            self.inner.fetch_quote(symbol).await
        }

        async fn fetch_historical_series(
            &self,
            symbol: &str,
        ) -> Result<Vec<HistoricalPoint>, mq_types::UpstreamError> {
            self.inner.fetch_historical_series(symbol).await
        }

        async fn fetch_overview(
            &self,
            symbol: &str,
        ) -> Result<mq_types::CompanyOverview, mq_types::UpstreamError> {
            self.inner.fetch_overview(symbol).await
        }

        fn config(&self) -> serde_json::Value {
            self.inner.config()
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_as_failed() {
        let source = Arc::new(PanicOnQuote {
            inner: StaticQuoteSource::sample(&["SPY", "QQQ", "XLB"]),
            symbol: "QQQ",
        });
        let store = Arc::new(QuoteStore::open_in_memory().unwrap());
        let engine = ReconciliationEngine::new(
            source,
            store,
            catalog(&["SPY", "QQQ"], &[("XLB", "Materials")]),
            2,
        );

        let report = engine.update_indexes().await.unwrap();

        assert_eq!(report.created, vec!["SPY".to_string(), "XLB".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].symbol, "QQQ");
        assert_eq!(report.succeeded() + report.failed.len(), engine.catalog().len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_during_refresh_keeps_sector_names() {
        let sectors = [
            ("XLB", "Materials"),
            ("XLE", "Energy"),
            ("XLF", "Financials"),
            ("XLI", "Industrials"),
            ("XLK", "Technology"),
            ("XLP", "Consumer Staples"),
            ("XLU", "Utilities"),
            ("XLV", "Healthcare"),
        ];
        let symbols: Vec<&str> = sectors.iter().map(|(s, _)| *s).collect();
        let source = Arc::new(StaticQuoteSource::sample(&symbols));
        let engine = engine_with(source, catalog(&[], &sectors));

        for _ in 0..25 {
            engine.get_all_sectors().await.unwrap();

            let refresher = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.update_indexes().await })
            };
            let clearer = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.clear_all().await })
            };
            let report = refresher.await.unwrap().unwrap();
            clearer.await.unwrap().unwrap();

            assert!(report.is_clean());
            for record in engine.store().find_all().unwrap() {
                assert_eq!(
                    record.display_name.as_deref(),
                    engine.catalog().display_name(&record.symbol),
                    "sector {} lost its display name",
                    record.symbol
                );
            }
        }
    }
}
