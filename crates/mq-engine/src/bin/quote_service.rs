use std::sync::Arc;

use mq_data::{AlphaVantageSource, QuoteSource, QuoteStore, StaticQuoteSource, SymbolCatalog};
use mq_engine::{ReconciliationEngine, RefreshScheduler};
use mq_types::ServiceConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::load()?;
    let db_path = config.resolved_database_path();
    let store = Arc::new(QuoteStore::open(&db_path)?);
    info!(path = %db_path.display(), "Quote store opened");

    let catalog = SymbolCatalog::new(&config.catalog)?;

    let source: Arc<dyn QuoteSource> = match config.provider.api_key.as_deref() {
        Some(key) => Arc::new(AlphaVantageSource::new(&config.provider.base_url, key)?),
        None => {
            warn!("No provider API key configured, serving deterministic sample quotes");
            Arc::new(StaticQuoteSource::sample(&catalog.all_tracked_symbols()))
        }
    };
    info!(
        source = source.name(),
        settings = %source.config(),
        symbols = catalog.len(),
        "Quote source ready"
    );

    let engine = ReconciliationEngine::new(
        source,
        store,
        catalog,
        config.schedule.max_concurrent_fetches,
    );

    if config.reset_on_startup {
        engine.clear_all().await?;
    }
    if config.refresh_on_startup {
        let report = engine.update_indexes().await?;
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded(),
            failed = report.failed.len(),
            "Startup refresh complete"
        );
    }

    let handle = RefreshScheduler::new(
        engine,
        config.schedule.price_refresh,
        config.schedule.historical_refresh,
    )
    .start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await;

    Ok(())
}
