use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use duckdb::{params, Connection, Transaction};
use mq_types::{
    merge_record, normalize_series, HistoricalPoint, MqError, MqResult, QuoteRecord, QuoteUpsert,
    StorageError,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS quote_records (
        symbol TEXT PRIMARY KEY,
        seq BIGINT NOT NULL,
        display_name TEXT,
        price TEXT NOT NULL,
        price_change TEXT NOT NULL,
        price_change_percent TEXT NOT NULL,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS historical_points (
        symbol TEXT NOT NULL,
        date TEXT NOT NULL,
        open_price TEXT NOT NULL,
        high_price TEXT NOT NULL,
        low_price TEXT NOT NULL,
        close_price TEXT NOT NULL,
        volume BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_historical_points_symbol_date ON historical_points(symbol, date);";

const DATE_FORMAT: &str = "%Y-%m-%d";

fn db_error(e: duckdb::Error) -> MqError {
    StorageError::Database {
        message: e.to_string(),
    }
    .into()
}

fn corruption(message: String) -> MqError {
    StorageError::Corruption { message }.into()
}

fn parse_decimal(raw: &str, column: &str, symbol: &str) -> MqResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| corruption(format!("{} for {} holds '{}': {}", column, symbol, raw, e)))
}

type RecordRow = (String, Option<String>, String, String, String);
type PointRow = (String, String, String, String, String, String, i64);

/// Persistent store holding one [`QuoteRecord`] per symbol, backed by DuckDB.
///
/// Every write commits before returning. Access to the connection is
/// serialized, so each upsert is atomic with respect to other writers.
#[derive(Debug)]
pub struct QuoteStore {
    connection: Mutex<Connection>,
}

impl QuoteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> MqResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection = Connection::open(db_path.as_ref()).map_err(db_error)?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> MqResult<Self> {
        let connection = Connection::open_in_memory().map_err(db_error)?;
        Self::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> MqResult<Self> {
        connection.execute_batch(SCHEMA).map_err(db_error)?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub fn find_by_symbol(&self, symbol: &str) -> MqResult<Option<QuoteRecord>> {
        let conn = self.connection.lock();
        Self::load_record(&conn, symbol)
    }

    /// Insert a new record or merge into the existing one.
    pub fn upsert(&self, incoming: QuoteUpsert) -> MqResult<QuoteRecord> {
        self.upsert_with_kind(incoming).map(|(record, _)| record)
    }

    /// Same as [`QuoteStore::upsert`], also reporting whether the record was
    /// inserted or merged. Both are decided inside one transaction.
    pub fn upsert_with_kind(&self, incoming: QuoteUpsert) -> MqResult<(QuoteRecord, UpsertKind)> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(db_error)?;

        let (record, kind) = match Self::load_record(&tx, &incoming.symbol)? {
            Some(existing) => {
                let replace_history = incoming.historical_series.is_some();
                let merged = merge_record(&existing, incoming);
                tx.execute(
                    "UPDATE quote_records
                     SET display_name = ?, price = ?, price_change = ?, price_change_percent = ?,
                         updated_at = CURRENT_TIMESTAMP
                     WHERE symbol = ?",
                    params![
                        merged.display_name,
                        merged.price.to_string(),
                        merged.change.to_string(),
                        merged.change_percent.to_string(),
                        merged.symbol,
                    ],
                )
                .map_err(db_error)?;

                if replace_history {
                    Self::write_series(&tx, &merged.symbol, &merged.historical_series)?;
                }
                (merged, UpsertKind::Updated)
            }
            None => {
                let record = incoming.into_record();
                let seq: i64 = tx
                    .query_row(
                        "SELECT COALESCE(MAX(seq), 0) + 1 FROM quote_records",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(db_error)?;

                tx.execute(
                    "INSERT INTO quote_records
                     (symbol, seq, display_name, price, price_change, price_change_percent)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params![
                        record.symbol,
                        seq,
                        record.display_name,
                        record.price.to_string(),
                        record.change.to_string(),
                        record.change_percent.to_string(),
                    ],
                )
                .map_err(db_error)?;

                Self::write_series(&tx, &record.symbol, &record.historical_series)?;
                (record, UpsertKind::Inserted)
            }
        };

        tx.commit().map_err(db_error)?;
        tracing::debug!(symbol = %record.symbol, kind = ?kind, "Upserted quote record");
        Ok((record, kind))
    }

    /// Replace the whole historical series of an existing record.
    pub fn replace_historical_series(
        &self,
        symbol: &str,
        points: Vec<HistoricalPoint>,
    ) -> MqResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(db_error)?;

        if !Self::exists(&tx, symbol)? {
            return Err(MqError::not_found(symbol));
        }

        let points = normalize_series(points);
        Self::write_series(&tx, symbol, &points)?;
        tx.execute(
            "UPDATE quote_records SET updated_at = CURRENT_TIMESTAMP WHERE symbol = ?",
            params![symbol],
        )
        .map_err(db_error)?;

        tx.commit().map_err(db_error)?;
        tracing::debug!(symbol = %symbol, points = points.len(), "Replaced historical series");
        Ok(())
    }

    /// Delete every record together with its historical points.
    pub fn clear_all(&self) -> MqResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(db_error)?;
        tx.execute_batch("DELETE FROM historical_points; DELETE FROM quote_records;")
            .map_err(db_error)?;
        tx.commit().map_err(db_error)?;

        tracing::info!("Cleared all cached quote records");
        Ok(())
    }

    /// All records in the order they were first persisted.
    pub fn find_all(&self) -> MqResult<Vec<QuoteRecord>> {
        let conn = self.connection.lock();

        let rows: Vec<RecordRow> = {
            let mut stmt = conn
                .prepare(
                    "SELECT symbol, display_name, price, price_change, price_change_percent
                     FROM quote_records ORDER BY seq",
                )
                .map_err(db_error)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .map_err(db_error)?;
            mapped.collect::<Result<_, _>>().map_err(db_error)?
        };

        let point_rows: Vec<PointRow> = {
            let mut stmt = conn
                .prepare(
                    "SELECT symbol, date, open_price, high_price, low_price, close_price, volume
                     FROM historical_points ORDER BY symbol, date",
                )
                .map_err(db_error)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })
                .map_err(db_error)?;
            mapped.collect::<Result<_, _>>().map_err(db_error)?
        };

        let mut series: HashMap<String, Vec<HistoricalPoint>> = HashMap::new();
        for row in point_rows {
            let symbol = row.0.clone();
            series.entry(symbol).or_default().push(Self::point_from_row(row)?);
        }

        rows.into_iter()
            .map(|row| {
                let history = series.remove(&row.0).unwrap_or_default();
                Self::record_from_row(row, history)
            })
            .collect()
    }

    pub fn get_stats(&self) -> MqResult<StoreStats> {
        let conn = self.connection.lock();
        let records: i64 = conn
            .query_row("SELECT COUNT(*) FROM quote_records", [], |row| row.get(0))
            .map_err(db_error)?;
        let points: i64 = conn
            .query_row("SELECT COUNT(*) FROM historical_points", [], |row| row.get(0))
            .map_err(db_error)?;

        Ok(StoreStats {
            total_records: records.max(0) as u64,
            total_points: points.max(0) as u64,
        })
    }

    fn exists(conn: &Connection, symbol: &str) -> MqResult<bool> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM quote_records WHERE symbol = ?",
                params![symbol],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        Ok(count > 0)
    }

    fn load_record(conn: &Connection, symbol: &str) -> MqResult<Option<QuoteRecord>> {
        let row: Option<RecordRow> = {
            let mut stmt = conn
                .prepare(
                    "SELECT symbol, display_name, price, price_change, price_change_percent
                     FROM quote_records WHERE symbol = ?",
                )
                .map_err(db_error)?;
            let mut mapped = stmt
                .query_map(params![symbol], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .map_err(db_error)?;
            mapped.next().transpose().map_err(db_error)?
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let history = Self::load_series(conn, symbol)?;
        Self::record_from_row(row, history).map(Some)
    }

    fn load_series(conn: &Connection, symbol: &str) -> MqResult<Vec<HistoricalPoint>> {
        let rows: Vec<PointRow> = {
            let mut stmt = conn
                .prepare(
                    "SELECT symbol, date, open_price, high_price, low_price, close_price, volume
                     FROM historical_points WHERE symbol = ? ORDER BY date",
                )
                .map_err(db_error)?;
            let mapped = stmt
                .query_map(params![symbol], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })
                .map_err(db_error)?;
            mapped.collect::<Result<_, _>>().map_err(db_error)?
        };

        rows.into_iter().map(Self::point_from_row).collect()
    }

    // Callers pass a normalized series, so (symbol, date) stays unique without
    // a key constraint on the table.
    fn write_series(tx: &Transaction<'_>, symbol: &str, points: &[HistoricalPoint]) -> MqResult<()> {
        tx.execute("DELETE FROM historical_points WHERE symbol = ?", params![symbol])
            .map_err(db_error)?;

        let mut stmt = tx
            .prepare(
                "INSERT INTO historical_points
                 (symbol, date, open_price, high_price, low_price, close_price, volume)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .map_err(db_error)?;

        for point in points {
            let volume = i64::try_from(point.volume).map_err(|_| {
                MqError::InvalidArgument(format!(
                    "volume {} on {} for {} exceeds storable range",
                    point.volume, point.date, symbol
                ))
            })?;

            stmt.execute(params![
                symbol,
                point.date.format(DATE_FORMAT).to_string(),
                point.open.to_string(),
                point.high.to_string(),
                point.low.to_string(),
                point.close.to_string(),
                volume,
            ])
            .map_err(db_error)?;
        }

        Ok(())
    }

    fn record_from_row(row: RecordRow, history: Vec<HistoricalPoint>) -> MqResult<QuoteRecord> {
        let (symbol, display_name, price, change, change_percent) = row;

        Ok(QuoteRecord {
            price: parse_decimal(&price, "price", &symbol)?,
            change: parse_decimal(&change, "price_change", &symbol)?,
            change_percent: parse_decimal(&change_percent, "price_change_percent", &symbol)?,
            symbol,
            display_name,
            historical_series: history,
        })
    }

    fn point_from_row(row: PointRow) -> MqResult<HistoricalPoint> {
        let (symbol, date, open, high, low, close, volume) = row;

        let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
            .map_err(|e| corruption(format!("date '{}' for {}: {}", date, symbol, e)))?;
        let volume = u64::try_from(volume)
            .map_err(|_| corruption(format!("negative volume {} for {} on {}", volume, symbol, date)))?;

        Ok(HistoricalPoint {
            date,
            open: parse_decimal(&open, "open_price", &symbol)?,
            high: parse_decimal(&high, "high_price", &symbol)?,
            low: parse_decimal(&low, "low_price", &symbol)?,
            close: parse_decimal(&close, "close_price", &symbol)?,
            volume,
        })
    }
}

/// Whether an upsert created the record or merged into an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_records: u64,
    pub total_points: u64,
}
