//! Embedded single-file backend over SQLite.
//!
//! Schema and operations mirror the relational backend. SQLite has no
//! arbitrary-precision numeric type, so decimal columns are stored as TEXT
//! (full 8-digit precision preserved) and timestamps as epoch-millisecond
//! INTEGERs. New-row counts come from a count delta inside the write
//! transaction. A single pooled connection serializes writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument};

use crate::error::{IngestError, Result};
use crate::models::{
    BookLevel, Candle, DataVersion, FundingRate, Liquidation, LongShortRatio, OpenInterest,
    OrderBookSnapshot,
};
use crate::storage::{
    with_storage_guard, BackendKind, StorageDriver, StorageInfo, WRITE_CHUNK_SIZE,
};
use crate::utils::time::{datetime_to_ms, ms_to_datetime};

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ohlcv (
        time INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        open TEXT NOT NULL,
        high TEXT NOT NULL,
        low TEXT NOT NULL,
        close TEXT NOT NULL,
        volume TEXT NOT NULL,
        quote_volume TEXT NOT NULL,
        trades INTEGER NOT NULL,
        taker_buy_base TEXT NOT NULL,
        taker_buy_quote TEXT NOT NULL,
        is_closed INTEGER NOT NULL,
        PRIMARY KEY (time, symbol, timeframe)
    )",
    "CREATE TABLE IF NOT EXISTS open_interest (
        time INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        period TEXT NOT NULL,
        open_interest TEXT NOT NULL,
        open_interest_value TEXT NOT NULL,
        PRIMARY KEY (time, symbol, period)
    )",
    "CREATE TABLE IF NOT EXISTS funding_rate (
        funding_time INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        funding_rate TEXT NOT NULL,
        mark_price TEXT,
        PRIMARY KEY (funding_time, symbol)
    )",
    "CREATE TABLE IF NOT EXISTS liquidation (
        order_id TEXT PRIMARY KEY,
        time INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        price TEXT NOT NULL,
        quantity TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS long_short_ratio (
        time INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        period TEXT NOT NULL,
        long_short_ratio TEXT NOT NULL,
        long_account TEXT NOT NULL,
        short_account TEXT NOT NULL,
        PRIMARY KEY (time, symbol, period)
    )",
    "CREATE TABLE IF NOT EXISTS order_book (
        time INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        level INTEGER NOT NULL,
        price TEXT NOT NULL,
        quantity TEXT NOT NULL,
        PRIMARY KEY (time, symbol, side, level)
    )",
    "CREATE TABLE IF NOT EXISTS data_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        symbol TEXT NOT NULL,
        window_start INTEGER NOT NULL,
        window_end INTEGER NOT NULL,
        record_count INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ohlcv_symbol_time ON ohlcv (symbol, timeframe, time)",
    "CREATE INDEX IF NOT EXISTS idx_oi_symbol_time ON open_interest (symbol, period, time)",
    "CREATE INDEX IF NOT EXISTS idx_liq_symbol_time ON liquidation (symbol, time)",
    "CREATE INDEX IF NOT EXISTS idx_book_symbol_time ON order_book (symbol, time)",
];

pub struct EmbeddedDriver {
    pool: SqlitePool,
    path: String,
    write_chunk: usize,
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| IngestError::Storage(format!("corrupt decimal column: {e}")))
}

fn ms_column(row: &SqliteRow, name: &str) -> Result<DateTime<Utc>> {
    let ms: i64 = row.try_get(name)?;
    ms_to_datetime(ms).map_err(|e| IngestError::Storage(format!("corrupt time column: {e}")))
}

fn bound_ms(value: Option<DateTime<Utc>>, default: i64) -> i64 {
    value.map(datetime_to_ms).unwrap_or(default)
}

impl EmbeddedDriver {
    /// Opens (creating if missing) the store at `path`. The special value
    /// `:memory:` opens a private in-memory database, used by the test
    /// batteries.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                IngestError::Storage(format!("invalid sqlite options: {e}"))
            })?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        IngestError::Storage(format!("create {}: {e}", parent.display()))
                    })?;
                }
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            path: path.to_string(),
            write_chunk: WRITE_CHUNK_SIZE,
        })
    }

    /// Overrides the rows-per-statement chunk size (`collection.batch_size`).
    pub fn with_write_chunk(mut self, chunk: usize) -> Self {
        self.write_chunk = chunk.max(1);
        self
    }

    async fn table_count(tx: &mut sqlx::SqliteConnection, table: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(tx)
            .await?;
        Ok(count)
    }

    async fn write_candles(&self, candles: &[Candle]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let before = Self::table_count(&mut tx, "ohlcv").await?;
        for chunk in candles.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO ohlcv (time, symbol, timeframe, open, high, low, close, \
                 volume, quote_volume, trades, taker_buy_base, taker_buy_quote, is_closed) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(datetime_to_ms(c.open_time))
                    .push_bind(&c.symbol)
                    .push_bind(&c.timeframe)
                    .push_bind(c.open.to_string())
                    .push_bind(c.high.to_string())
                    .push_bind(c.low.to_string())
                    .push_bind(c.close.to_string())
                    .push_bind(c.volume.to_string())
                    .push_bind(c.quote_volume.to_string())
                    .push_bind(c.trades)
                    .push_bind(c.taker_buy_base.to_string())
                    .push_bind(c.taker_buy_quote.to_string())
                    .push_bind(c.is_closed);
            });
            qb.push(
                " ON CONFLICT (time, symbol, timeframe) DO UPDATE SET \
                 open = excluded.open, high = excluded.high, low = excluded.low, \
                 close = excluded.close, volume = excluded.volume, \
                 quote_volume = excluded.quote_volume, trades = excluded.trades, \
                 taker_buy_base = excluded.taker_buy_base, \
                 taker_buy_quote = excluded.taker_buy_quote, \
                 is_closed = excluded.is_closed",
            );
            qb.build().execute(&mut *tx).await?;
        }
        let after = Self::table_count(&mut tx, "ohlcv").await?;
        tx.commit().await?;
        Ok((after - before).max(0) as u64)
    }

    async fn write_open_interest(&self, samples: &[OpenInterest]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let before = Self::table_count(&mut tx, "open_interest").await?;
        for chunk in samples.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO open_interest (time, symbol, period, open_interest, open_interest_value) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(datetime_to_ms(s.time))
                    .push_bind(&s.symbol)
                    .push_bind(&s.period)
                    .push_bind(s.open_interest.to_string())
                    .push_bind(s.open_interest_value.to_string());
            });
            qb.push(
                " ON CONFLICT (time, symbol, period) DO UPDATE SET \
                 open_interest = excluded.open_interest, \
                 open_interest_value = excluded.open_interest_value",
            );
            qb.build().execute(&mut *tx).await?;
        }
        let after = Self::table_count(&mut tx, "open_interest").await?;
        tx.commit().await?;
        Ok((after - before).max(0) as u64)
    }

    async fn write_funding_rates(&self, events: &[FundingRate]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in events.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO funding_rate (funding_time, symbol, funding_rate, mark_price) ",
            );
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(datetime_to_ms(e.funding_time))
                    .push_bind(&e.symbol)
                    .push_bind(e.funding_rate.to_string())
                    .push_bind(e.mark_price.map(|p| p.to_string()));
            });
            qb.push(" ON CONFLICT (funding_time, symbol) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_liquidations(&self, orders: &[Liquidation]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in orders.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO liquidation (order_id, time, symbol, side, price, quantity) ",
            );
            qb.push_values(chunk, |mut b, o| {
                b.push_bind(&o.order_id)
                    .push_bind(datetime_to_ms(o.time))
                    .push_bind(&o.symbol)
                    .push_bind(o.side.as_str())
                    .push_bind(o.price.to_string())
                    .push_bind(o.quantity.to_string());
            });
            qb.push(" ON CONFLICT (order_id) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_long_short_ratios(&self, samples: &[LongShortRatio]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let before = Self::table_count(&mut tx, "long_short_ratio").await?;
        for chunk in samples.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO long_short_ratio (time, symbol, period, long_short_ratio, long_account, short_account) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(datetime_to_ms(s.time))
                    .push_bind(&s.symbol)
                    .push_bind(&s.period)
                    .push_bind(s.long_short_ratio.to_string())
                    .push_bind(s.long_account.to_string())
                    .push_bind(s.short_account.to_string());
            });
            qb.push(
                " ON CONFLICT (time, symbol, period) DO UPDATE SET \
                 long_short_ratio = excluded.long_short_ratio, \
                 long_account = excluded.long_account, \
                 short_account = excluded.short_account",
            );
            qb.build().execute(&mut *tx).await?;
        }
        let after = Self::table_count(&mut tx, "long_short_ratio").await?;
        tx.commit().await?;
        Ok((after - before).max(0) as u64)
    }

    async fn write_order_book(&self, snapshot: &OrderBookSnapshot) -> Result<u64> {
        let rows = snapshot.rows();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM order_book WHERE symbol = ? AND time = ?")
            .bind(&snapshot.symbol)
            .bind(datetime_to_ms(snapshot.time))
            .execute(&mut *tx)
            .await?;
        let mut written = 0u64;
        for chunk in rows.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO order_book (time, symbol, side, level, price, quantity) ",
            );
            qb.push_values(chunk, |mut b, (side, level, price, quantity)| {
                b.push_bind(datetime_to_ms(snapshot.time))
                    .push_bind(&snapshot.symbol)
                    .push_bind(side.as_str())
                    .push_bind(level)
                    .push_bind(price.to_string())
                    .push_bind(quantity.to_string());
            });
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    fn candle_from_row(row: &SqliteRow) -> Result<Candle> {
        Ok(Candle {
            open_time: ms_column(row, "time")?,
            symbol: row.try_get("symbol")?,
            timeframe: row.try_get("timeframe")?,
            open: parse_decimal(&row.try_get::<String, _>("open")?)?,
            high: parse_decimal(&row.try_get::<String, _>("high")?)?,
            low: parse_decimal(&row.try_get::<String, _>("low")?)?,
            close: parse_decimal(&row.try_get::<String, _>("close")?)?,
            volume: parse_decimal(&row.try_get::<String, _>("volume")?)?,
            quote_volume: parse_decimal(&row.try_get::<String, _>("quote_volume")?)?,
            trades: row.try_get("trades")?,
            taker_buy_base: parse_decimal(&row.try_get::<String, _>("taker_buy_base")?)?,
            taker_buy_quote: parse_decimal(&row.try_get::<String, _>("taker_buy_quote")?)?,
            is_closed: row.try_get("is_closed")?,
        })
    }
}

#[async_trait]
impl StorageDriver for EmbeddedDriver {
    #[instrument(skip(self))]
    async fn init(&self) -> Result<()> {
        for ddl in CREATE_TABLES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        info!(path = %self.path, "embedded schema initialized");
        Ok(())
    }

    async fn save_candles_batch(&self, candles: &[Candle]) -> Result<u64> {
        if candles.is_empty() {
            return Ok(0);
        }
        with_storage_guard(|| self.write_candles(candles)).await
    }

    async fn save_open_interest_batch(&self, samples: &[OpenInterest]) -> Result<u64> {
        if samples.is_empty() {
            return Ok(0);
        }
        with_storage_guard(|| self.write_open_interest(samples)).await
    }

    async fn save_funding_rates_batch(&self, events: &[FundingRate]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        with_storage_guard(|| self.write_funding_rates(events)).await
    }

    async fn save_liquidations_batch(&self, orders: &[Liquidation]) -> Result<u64> {
        if orders.is_empty() {
            return Ok(0);
        }
        with_storage_guard(|| self.write_liquidations(orders)).await
    }

    async fn save_long_short_ratios_batch(&self, samples: &[LongShortRatio]) -> Result<u64> {
        if samples.is_empty() {
            return Ok(0);
        }
        with_storage_guard(|| self.write_long_short_ratios(samples)).await
    }

    async fn save_order_book_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<u64> {
        with_storage_guard(|| self.write_order_book(snapshot)).await
    }

    async fn save_data_version(&self, version: &DataVersion) -> Result<()> {
        with_storage_guard(|| async {
            sqlx::query(
                "INSERT INTO data_versions \
                 (table_name, symbol, window_start, window_end, record_count, checksum, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&version.table_name)
            .bind(&version.symbol)
            .bind(datetime_to_ms(version.window_start))
            .bind(datetime_to_ms(version.window_end))
            .bind(version.record_count)
            .bind(&version.checksum)
            .bind(datetime_to_ms(version.created_at))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT * FROM ohlcv WHERE symbol = ? AND timeframe = ? \
             AND time >= ? AND time <= ? ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(bound_ms(start, i64::MIN))
        .bind(bound_ms(end, i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::candle_from_row).collect()
    }

    async fn get_latest_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT * FROM ohlcv WHERE symbol = ? AND timeframe = ? \
             ORDER BY time DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::candle_from_row).collect()
    }

    async fn get_open_interest(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<OpenInterest>> {
        let rows = sqlx::query(
            "SELECT * FROM open_interest WHERE symbol = ? AND period = ? \
             AND time >= ? AND time <= ? ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(period)
        .bind(bound_ms(start, i64::MIN))
        .bind(bound_ms(end, i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(OpenInterest {
                    time: ms_column(row, "time")?,
                    symbol: row.try_get("symbol")?,
                    period: row.try_get("period")?,
                    open_interest: parse_decimal(&row.try_get::<String, _>("open_interest")?)?,
                    open_interest_value: parse_decimal(
                        &row.try_get::<String, _>("open_interest_value")?,
                    )?,
                })
            })
            .collect()
    }

    async fn get_funding_rates(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingRate>> {
        let rows = sqlx::query(
            "SELECT * FROM funding_rate WHERE symbol = ? \
             AND funding_time >= ? AND funding_time <= ? ORDER BY funding_time ASC",
        )
        .bind(symbol)
        .bind(bound_ms(start, i64::MIN))
        .bind(bound_ms(end, i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let mark_price: Option<String> = row.try_get("mark_price")?;
                Ok(FundingRate {
                    funding_time: ms_column(row, "funding_time")?,
                    symbol: row.try_get("symbol")?,
                    funding_rate: parse_decimal(&row.try_get::<String, _>("funding_rate")?)?,
                    mark_price: mark_price.as_deref().map(parse_decimal).transpose()?,
                })
            })
            .collect()
    }

    async fn get_liquidations(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Liquidation>> {
        let rows = sqlx::query(
            "SELECT * FROM liquidation WHERE symbol = ? \
             AND time >= ? AND time <= ? ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(bound_ms(start, i64::MIN))
        .bind(bound_ms(end, i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let side: String = row.try_get("side")?;
                Ok(Liquidation {
                    order_id: row.try_get("order_id")?,
                    time: ms_column(row, "time")?,
                    symbol: row.try_get("symbol")?,
                    side: side
                        .parse()
                        .map_err(|e: String| IngestError::Storage(format!("corrupt side: {e}")))?,
                    price: parse_decimal(&row.try_get::<String, _>("price")?)?,
                    quantity: parse_decimal(&row.try_get::<String, _>("quantity")?)?,
                })
            })
            .collect()
    }

    async fn get_long_short_ratios(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<LongShortRatio>> {
        let rows = sqlx::query(
            "SELECT * FROM long_short_ratio WHERE symbol = ? AND period = ? \
             AND time >= ? AND time <= ? ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(period)
        .bind(bound_ms(start, i64::MIN))
        .bind(bound_ms(end, i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(LongShortRatio {
                    time: ms_column(row, "time")?,
                    symbol: row.try_get("symbol")?,
                    period: row.try_get("period")?,
                    long_short_ratio: parse_decimal(&row.try_get::<String, _>("long_short_ratio")?)?,
                    long_account: parse_decimal(&row.try_get::<String, _>("long_account")?)?,
                    short_account: parse_decimal(&row.try_get::<String, _>("short_account")?)?,
                })
            })
            .collect()
    }

    async fn get_latest_order_book(&self, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT time FROM order_book WHERE symbol = ? ORDER BY time DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        let Some(time_ms) = latest else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT side, level, price, quantity FROM order_book \
             WHERE symbol = ? AND time = ? ORDER BY side, level",
        )
        .bind(symbol)
        .bind(time_ms)
        .fetch_all(&self.pool)
        .await?;

        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for row in &rows {
            let side: String = row.try_get("side")?;
            let level = BookLevel {
                price: parse_decimal(&row.try_get::<String, _>("price")?)?,
                quantity: parse_decimal(&row.try_get::<String, _>("quantity")?)?,
            };
            match side.as_str() {
                "BID" => bids.push(level),
                _ => asks.push(level),
            }
        }
        Ok(Some(OrderBookSnapshot {
            symbol: symbol.to_string(),
            time: ms_to_datetime(time_ms)
                .map_err(|e| IngestError::Storage(format!("corrupt time column: {e}")))?,
            bids,
            asks,
        }))
    }

    async fn get_data_versions(
        &self,
        table_name: &str,
        symbol: &str,
        count: u32,
    ) -> Result<Vec<DataVersion>> {
        let rows = sqlx::query(
            "SELECT * FROM data_versions WHERE table_name = ? AND symbol = ? \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(table_name)
        .bind(symbol)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DataVersion {
                    table_name: row.try_get("table_name")?,
                    symbol: row.try_get("symbol")?,
                    window_start: ms_column(row, "window_start")?,
                    window_end: ms_column(row, "window_end")?,
                    record_count: row.try_get("record_count")?,
                    checksum: row.try_get("checksum")?,
                    created_at: ms_column(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    async fn info(&self) -> Result<StorageInfo> {
        let initialized: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'ohlcv')",
        )
        .fetch_one(&self.pool)
        .await?;
        let size_bytes = if self.path == ":memory:" {
            None
        } else {
            std::fs::metadata(&self.path).ok().map(|m| m.len())
        };
        Ok(StorageInfo {
            backend: BackendKind::EmbeddedFile,
            initialized,
            size_bytes,
        })
    }
}
