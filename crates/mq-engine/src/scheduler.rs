//! Periodic refresh jobs.
//!
//! Two independent loops: the price refresh and the historical refresh. Each
//! waits for its trigger, runs its job to completion, then waits again, so a
//! job never overlaps itself. A failed run is logged and the loop carries on.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use mq_types::{MqResult, Trigger};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::reconcile::{RefreshJob, RefreshReport, ReconciliationEngine};

#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    engine: ReconciliationEngine,
    price_trigger: Trigger,
    historical_trigger: Trigger,
}

/// Running scheduler; dropping it without `shutdown` leaves the loops running.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop both loops and wait for any in-flight run to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Refresh loop terminated abnormally");
            }
        }
        info!("Refresh scheduler stopped");
    }
}

impl RefreshScheduler {
    pub fn new(engine: ReconciliationEngine, price_trigger: Trigger, historical_trigger: Trigger) -> Self {
        Self {
            engine,
            price_trigger,
            historical_trigger,
        }
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);

        let prices = {
            let engine = self.engine.clone();
            tokio::spawn(run_loop(RefreshJob::Prices, self.price_trigger, rx.clone(), move || {
                let engine = engine.clone();
                async move { engine.update_indexes().await }
            }))
        };

        let historical = {
            let engine = self.engine.clone();
            tokio::spawn(run_loop(
                RefreshJob::Historical,
                self.historical_trigger,
                rx,
                move || {
                    let engine = engine.clone();
                    async move { engine.update_all_historical_data().await }
                },
            ))
        };

        info!(
            price_trigger = ?self.price_trigger,
            historical_trigger = ?self.historical_trigger,
            "Refresh scheduler started"
        );

        SchedulerHandle {
            shutdown,
            tasks: vec![prices, historical],
        }
    }
}

async fn run_loop<F, Fut>(
    job: RefreshJob,
    trigger: Trigger,
    mut shutdown: watch::Receiver<bool>,
    mut run: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = MqResult<RefreshReport>> + Send,
{
    // Fixed periods keep their cadence; a slow run pushes later ticks back
    // instead of bursting.
    let mut ticker = match trigger {
        Trigger::Every { seconds } => {
            let period = Duration::from_secs(seconds.max(1));
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        }
        Trigger::DailyAt { .. } => None,
    };

    loop {
        let wait = async {
            match ticker.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => sleep(trigger.next_delay(Utc::now())).await,
            }
        };

        tokio::select! {
            _ = wait => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match run().await {
            Ok(report) if !report.is_clean() => {
                info!(?job, run_id = %report.run_id, failed = report.failed.len(), "Scheduled refresh completed with failures");
            }
            Ok(_) => {}
            Err(e) => error!(?job, error = %e, "Scheduled refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_data::{QuoteStore, StaticQuoteSource, SymbolCatalog};
    use mq_types::CatalogConfig;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn engine(source: Arc<StaticQuoteSource>) -> ReconciliationEngine {
        let catalog = SymbolCatalog::new(&CatalogConfig {
            index_symbols: vec!["SPY".to_string(), "QQQ".to_string()],
            sector_symbols: BTreeMap::new(),
        })
        .unwrap();
        let store = Arc::new(QuoteStore::open_in_memory().unwrap());
        ReconciliationEngine::new(source, store, catalog, 2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_loop_fires_each_period_until_shutdown() {
        let source = Arc::new(StaticQuoteSource::sample(&["SPY", "QQQ"]));
        let scheduler = RefreshScheduler::new(
            engine(source.clone()),
            Trigger::Every { seconds: 60 },
            Trigger::DailyAt { hour: 21, minute: 30 },
        );
        let handle = scheduler.start();

        sleep(Duration::from_secs(30)).await;
        assert_eq!(source.total_quote_calls(), 0);

        sleep(Duration::from_secs(121)).await;
        assert!(source.total_quote_calls() >= 2 * 2);

        handle.shutdown().await;
        let after_stop = source.total_quote_calls();

        sleep(Duration::from_secs(600)).await;
        assert_eq!(source.total_quote_calls(), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_runs_do_not_stop_the_loop() {
        let source = Arc::new(StaticQuoteSource::sample(&["SPY", "QQQ"]));
        source.fail_symbol("SPY");
        let engine = engine(source.clone());
        let handle = RefreshScheduler::new(
            engine.clone(),
            Trigger::Every { seconds: 10 },
            Trigger::DailyAt { hour: 3, minute: 0 },
        )
        .start();

        sleep(Duration::from_secs(25)).await;
        assert!(source.quote_calls("QQQ") >= 2);
        assert!(engine.store().find_by_symbol("SPY").unwrap().is_none());

        source.recover_symbol("SPY");
        sleep(Duration::from_secs(10)).await;
        assert!(engine.store().find_by_symbol("SPY").unwrap().is_some());

        handle.shutdown().await;
    }
}
