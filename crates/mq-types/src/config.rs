use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config_error;
use crate::errors::MqResult;

pub const ENV_CONFIG_PATH: &str = "MQ_CONFIG";
pub const ENV_API_KEY: &str = "MQ_API_KEY";
pub const ENV_DATABASE_PATH: &str = "MQ_DATABASE_PATH";
pub const ENV_BASE_URL: &str = "MQ_BASE_URL";

/// Tracked symbols: plain indexes in display order, sectors keyed by symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub index_symbols: Vec<String>,
    pub sector_symbols: BTreeMap<String, String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        let index_symbols = ["SPY", "QQQ", "VTI", "IWM", "VIG", "GLD", "AGG"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let sector_symbols = [
            ("XLF", "Financials"),
            ("XLK", "Technology"),
            ("XLV", "Healthcare"),
            ("XLE", "Energy"),
            ("XLY", "Consumer Discretionary"),
            ("XLP", "Consumer Staples"),
            ("XLI", "Industrials"),
            ("XLB", "Materials"),
            ("XLU", "Utilities"),
            ("XLRE", "Real Estate"),
        ]
        .iter()
        .map(|(symbol, name)| (symbol.to_string(), name.to_string()))
        .collect();

        Self {
            index_symbols,
            sector_symbols,
        }
    }
}

impl CatalogConfig {
    pub fn validate(&self) -> MqResult<()> {
        let mut seen = HashSet::new();
        for symbol in &self.index_symbols {
            if symbol.trim().is_empty() {
                return Err(config_error!("index symbol list contains an empty symbol"));
            }
            if !seen.insert(symbol.as_str()) {
                return Err(config_error!("index symbol {} is listed twice", symbol));
            }
        }

        for (symbol, name) in &self.sector_symbols {
            if symbol.trim().is_empty() {
                return Err(config_error!("sector mapping contains an empty symbol"));
            }
            if name.trim().is_empty() {
                return Err(config_error!("sector {} has an empty display name", symbol));
            }
            if seen.contains(symbol.as_str()) {
                return Err(config_error!(
                    "symbol {} is tracked both as an index and as a sector",
                    symbol
                ));
            }
        }

        Ok(())
    }
}

/// When a refresh job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fixed period, first run one period after start.
    Every { seconds: u64 },
    /// Once a day at a wall-clock time (UTC).
    DailyAt { hour: u32, minute: u32 },
}

impl Trigger {
    pub fn validate(&self) -> MqResult<()> {
        match *self {
            Trigger::Every { seconds } if seconds == 0 => {
                Err(config_error!("refresh interval must be at least one second"))
            }
            Trigger::DailyAt { hour, minute } if hour > 23 || minute > 59 => Err(config_error!(
                "daily trigger time {:02}:{:02} is out of range",
                hour,
                minute
            )),
            _ => Ok(()),
        }
    }

    /// Delay from `now` until the next firing.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match *self {
            Trigger::Every { seconds } => Duration::from_secs(seconds.max(1)),
            Trigger::DailyAt { hour, minute } => {
                let at = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0)
                    .unwrap_or_default();
                let mut next = now.date_naive().and_time(at).and_utc();
                if next <= now {
                    next += ChronoDuration::days(1);
                }
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub price_refresh: Trigger,
    pub historical_refresh: Trigger,
    pub max_concurrent_fetches: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            price_refresh: Trigger::Every { seconds: 3600 },
            historical_refresh: Trigger::DailyAt { hour: 21, minute: 30 },
            max_concurrent_fetches: 4,
        }
    }
}

/// Upstream quote provider settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.alphavantage.co/query".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub catalog: CatalogConfig,
    pub schedule: ScheduleConfig,
    pub provider: ProviderConfig,
    pub database_path: Option<PathBuf>,
    pub reset_on_startup: bool,
    pub refresh_on_startup: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            schedule: ScheduleConfig::default(),
            provider: ProviderConfig::default(),
            database_path: None,
            reset_on_startup: false,
            refresh_on_startup: true,
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the JSON file named by `MQ_CONFIG`, then env overrides.
    pub fn load() -> MqResult<Self> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MqResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ServiceConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY).filter(|k| !k.is_empty()) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_BASE_URL).filter(|u| !u.is_empty()) {
            self.provider.base_url = url;
        }
        if let Some(path) = lookup(ENV_DATABASE_PATH).filter(|p| !p.is_empty()) {
            self.database_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> MqResult<()> {
        self.catalog.validate()?;
        self.schedule.price_refresh.validate()?;
        self.schedule.historical_refresh.validate()?;
        if self.schedule.max_concurrent_fetches == 0 {
            return Err(config_error!("max_concurrent_fetches must be at least 1"));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(config_error!("provider base_url is empty"));
        }
        Ok(())
    }

    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("marketquote")
                .join("quotes.duckdb")
        })
    }
}
