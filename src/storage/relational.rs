//! Relational backend: PostgreSQL with TimescaleDB extensions.
//!
//! Time-series tables are keyed exactly as the data model requires and
//! converted to hypertables when the extension is available; everything
//! degrades to plain tables when it is not. Upserts run server-side with
//! `ON CONFLICT`, and `RETURNING (xmax = 0)` distinguishes inserts from
//! replacements so batch writers can report how many rows were new.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::DatabaseSettings;
use crate::error::{IngestError, Result};
use crate::models::{
    BookLevel, Candle, DataVersion, FundingRate, Liquidation, LongShortRatio, OpenInterest,
    OrderBookSnapshot, Side,
};
use crate::storage::{
    with_storage_guard, BackendKind, StorageDriver, StorageInfo, WRITE_CHUNK_SIZE,
};

// A single INSERT may not touch the same key twice (DO UPDATE raises
// "cannot affect row a second time"), so batches are deduplicated first,
// keeping the last occurrence.
fn dedupe_last<T, K: std::hash::Hash + Eq>(records: &[T], key: impl Fn(&T) -> K) -> Vec<&T> {
    let mut by_key: std::collections::HashMap<K, &T> = std::collections::HashMap::new();
    for record in records {
        by_key.insert(key(record), record);
    }
    by_key.into_values().collect()
}

// Pool sizing: 20 base connections plus 40 overflow, pre-ping before reuse,
// recycle after one hour.
const POOL_MIN_CONNECTIONS: u32 = 20;
const POOL_MAX_CONNECTIONS: u32 = 60;
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(3600);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ohlcv (
        time TIMESTAMPTZ NOT NULL,
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        open NUMERIC(30,8) NOT NULL,
        high NUMERIC(30,8) NOT NULL,
        low NUMERIC(30,8) NOT NULL,
        close NUMERIC(30,8) NOT NULL,
        volume NUMERIC(30,8) NOT NULL,
        quote_volume NUMERIC(30,8) NOT NULL,
        trades BIGINT NOT NULL,
        taker_buy_base NUMERIC(30,8) NOT NULL,
        taker_buy_quote NUMERIC(30,8) NOT NULL,
        is_closed BOOLEAN NOT NULL,
        PRIMARY KEY (time, symbol, timeframe)
    )",
    "CREATE TABLE IF NOT EXISTS open_interest (
        time TIMESTAMPTZ NOT NULL,
        symbol TEXT NOT NULL,
        period TEXT NOT NULL,
        open_interest NUMERIC(30,8) NOT NULL,
        open_interest_value NUMERIC(30,8) NOT NULL,
        PRIMARY KEY (time, symbol, period)
    )",
    "CREATE TABLE IF NOT EXISTS funding_rate (
        funding_time TIMESTAMPTZ NOT NULL,
        symbol TEXT NOT NULL,
        funding_rate NUMERIC(18,8) NOT NULL,
        mark_price NUMERIC(30,8),
        PRIMARY KEY (funding_time, symbol)
    )",
    "CREATE TABLE IF NOT EXISTS liquidation (
        order_id TEXT PRIMARY KEY,
        time TIMESTAMPTZ NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        price NUMERIC(30,8) NOT NULL,
        quantity NUMERIC(30,8) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS long_short_ratio (
        time TIMESTAMPTZ NOT NULL,
        symbol TEXT NOT NULL,
        period TEXT NOT NULL,
        long_short_ratio NUMERIC(18,8) NOT NULL,
        long_account NUMERIC(18,8) NOT NULL,
        short_account NUMERIC(18,8) NOT NULL,
        PRIMARY KEY (time, symbol, period)
    )",
    "CREATE TABLE IF NOT EXISTS order_book (
        time TIMESTAMPTZ NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        level INTEGER NOT NULL,
        price NUMERIC(30,8) NOT NULL,
        quantity NUMERIC(30,8) NOT NULL,
        PRIMARY KEY (time, symbol, side, level)
    )",
    "CREATE TABLE IF NOT EXISTS data_versions (
        id BIGSERIAL PRIMARY KEY,
        table_name TEXT NOT NULL,
        symbol TEXT NOT NULL,
        window_start TIMESTAMPTZ NOT NULL,
        window_end TIMESTAMPTZ NOT NULL,
        record_count BIGINT NOT NULL,
        checksum TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ohlcv_symbol_time ON ohlcv (symbol, timeframe, time)",
    "CREATE INDEX IF NOT EXISTS idx_oi_symbol_time ON open_interest (symbol, period, time)",
    "CREATE INDEX IF NOT EXISTS idx_funding_symbol_time ON funding_rate (symbol, funding_time)",
    "CREATE INDEX IF NOT EXISTS idx_liq_symbol_time ON liquidation (symbol, time)",
    "CREATE INDEX IF NOT EXISTS idx_lsr_symbol_time ON long_short_ratio (symbol, period, time)",
    "CREATE INDEX IF NOT EXISTS idx_book_symbol_time ON order_book (symbol, time)",
];

// Applied best-effort; a plain-PostgreSQL deployment works without them.
const TIMESCALE_SETUP: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS timescaledb CASCADE",
    "SELECT create_hypertable('ohlcv', 'time', if_not_exists => TRUE, migrate_data => TRUE)",
    "SELECT create_hypertable('open_interest', 'time', if_not_exists => TRUE, migrate_data => TRUE)",
    "SELECT create_hypertable('funding_rate', 'funding_time', if_not_exists => TRUE, migrate_data => TRUE)",
    "SELECT create_hypertable('long_short_ratio', 'time', if_not_exists => TRUE, migrate_data => TRUE)",
    "SELECT create_hypertable('order_book', 'time', if_not_exists => TRUE, migrate_data => TRUE)",
    "CREATE MATERIALIZED VIEW IF NOT EXISTS oi_price_1h
        WITH (timescaledb.continuous) AS
        SELECT time_bucket('1 hour', time) AS bucket,
               symbol,
               avg(open_interest) AS avg_open_interest,
               avg(open_interest_value) AS avg_open_interest_value
        FROM open_interest
        GROUP BY bucket, symbol
        WITH NO DATA",
    "SELECT add_continuous_aggregate_policy('oi_price_1h',
        start_offset => INTERVAL '2 hours',
        end_offset => INTERVAL '5 minutes',
        schedule_interval => INTERVAL '5 minutes',
        if_not_exists => TRUE)",
    "CREATE OR REPLACE VIEW oi_price_1h_joined AS
        SELECT a.bucket, a.symbol, a.avg_open_interest, a.avg_open_interest_value, c.close
        FROM oi_price_1h a
        JOIN ohlcv c ON c.symbol = a.symbol AND c.timeframe = '1h' AND c.time = a.bucket",
];

pub struct RelationalDriver {
    pool: PgPool,
    write_chunk: usize,
}

impl RelationalDriver {
    /// Connects the pool; the schema is created by [`StorageDriver::init`].
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(POOL_MIN_CONNECTIONS)
            .max_connections(POOL_MAX_CONNECTIONS)
            .max_lifetime(POOL_MAX_LIFETIME)
            .acquire_timeout(CONNECT_TIMEOUT)
            .test_before_acquire(true)
            .connect(&settings.connection_url())
            .await?;
        Ok(Self {
            pool,
            write_chunk: WRITE_CHUNK_SIZE,
        })
    }

    /// For tests running against an already-provisioned database.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            write_chunk: WRITE_CHUNK_SIZE,
        }
    }

    /// Overrides the rows-per-statement chunk size (`collection.batch_size`).
    pub fn with_write_chunk(mut self, chunk: usize) -> Self {
        self.write_chunk = chunk.max(1);
        self
    }

    async fn write_candles(&self, candles: &[Candle]) -> Result<u64> {
        let deduped = dedupe_last(candles, |c| {
            (c.open_time, c.symbol.clone(), c.timeframe.clone())
        });
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in deduped.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO ohlcv (time, symbol, timeframe, open, high, low, close, \
                 volume, quote_volume, trades, taker_buy_base, taker_buy_quote, is_closed) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(c.open_time)
                    .push_bind(&c.symbol)
                    .push_bind(&c.timeframe)
                    .push_bind(c.open)
                    .push_bind(c.high)
                    .push_bind(c.low)
                    .push_bind(c.close)
                    .push_bind(c.volume)
                    .push_bind(c.quote_volume)
                    .push_bind(c.trades)
                    .push_bind(c.taker_buy_base)
                    .push_bind(c.taker_buy_quote)
                    .push_bind(c.is_closed);
            });
            qb.push(
                " ON CONFLICT (time, symbol, timeframe) DO UPDATE SET \
                 open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low, \
                 close = EXCLUDED.close, volume = EXCLUDED.volume, \
                 quote_volume = EXCLUDED.quote_volume, trades = EXCLUDED.trades, \
                 taker_buy_base = EXCLUDED.taker_buy_base, \
                 taker_buy_quote = EXCLUDED.taker_buy_quote, \
                 is_closed = EXCLUDED.is_closed \
                 RETURNING (xmax = 0) AS inserted",
            );
            let rows = qb.build().fetch_all(&mut *tx).await?;
            inserted += rows
                .iter()
                .filter(|row| row.get::<bool, _>("inserted"))
                .count() as u64;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_open_interest(&self, samples: &[OpenInterest]) -> Result<u64> {
        let deduped = dedupe_last(samples, |s| (s.time, s.symbol.clone(), s.period.clone()));
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in deduped.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO open_interest (time, symbol, period, open_interest, open_interest_value) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(s.time)
                    .push_bind(&s.symbol)
                    .push_bind(&s.period)
                    .push_bind(s.open_interest)
                    .push_bind(s.open_interest_value);
            });
            // Last writer wins for a re-observed sample.
            qb.push(
                " ON CONFLICT (time, symbol, period) DO UPDATE SET \
                 open_interest = EXCLUDED.open_interest, \
                 open_interest_value = EXCLUDED.open_interest_value \
                 RETURNING (xmax = 0) AS inserted",
            );
            let rows = qb.build().fetch_all(&mut *tx).await?;
            inserted += rows
                .iter()
                .filter(|row| row.get::<bool, _>("inserted"))
                .count() as u64;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_funding_rates(&self, events: &[FundingRate]) -> Result<u64> {
        let deduped = dedupe_last(events, |e| (e.funding_time, e.symbol.clone()));
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in deduped.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO funding_rate (funding_time, symbol, funding_rate, mark_price) ",
            );
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(e.funding_time)
                    .push_bind(&e.symbol)
                    .push_bind(e.funding_rate)
                    .push_bind(e.mark_price);
            });
            // The funding log is immutable.
            qb.push(" ON CONFLICT (funding_time, symbol) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_liquidations(&self, orders: &[Liquidation]) -> Result<u64> {
        let deduped = dedupe_last(orders, |o| o.order_id.clone());
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in deduped.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO liquidation (order_id, time, symbol, side, price, quantity) ",
            );
            qb.push_values(chunk, |mut b, o| {
                b.push_bind(&o.order_id)
                    .push_bind(o.time)
                    .push_bind(&o.symbol)
                    .push_bind(o.side.as_str())
                    .push_bind(o.price)
                    .push_bind(o.quantity);
            });
            qb.push(" ON CONFLICT (order_id) DO NOTHING");
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_long_short_ratios(&self, samples: &[LongShortRatio]) -> Result<u64> {
        let deduped = dedupe_last(samples, |s| (s.time, s.symbol.clone(), s.period.clone()));
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in deduped.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO long_short_ratio (time, symbol, period, long_short_ratio, long_account, short_account) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(s.time)
                    .push_bind(&s.symbol)
                    .push_bind(&s.period)
                    .push_bind(s.long_short_ratio)
                    .push_bind(s.long_account)
                    .push_bind(s.short_account);
            });
            qb.push(
                " ON CONFLICT (time, symbol, period) DO UPDATE SET \
                 long_short_ratio = EXCLUDED.long_short_ratio, \
                 long_account = EXCLUDED.long_account, \
                 short_account = EXCLUDED.short_account \
                 RETURNING (xmax = 0) AS inserted",
            );
            let rows = qb.build().fetch_all(&mut *tx).await?;
            inserted += rows
                .iter()
                .filter(|row| row.get::<bool, _>("inserted"))
                .count() as u64;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_order_book(&self, snapshot: &OrderBookSnapshot) -> Result<u64> {
        let rows = snapshot.rows();
        let mut tx = self.pool.begin().await?;
        // Full replace per snapshot timestamp.
        sqlx::query("DELETE FROM order_book WHERE symbol = $1 AND time = $2")
            .bind(&snapshot.symbol)
            .bind(snapshot.time)
            .execute(&mut *tx)
            .await?;
        let mut written = 0u64;
        for chunk in rows.chunks(self.write_chunk) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO order_book (time, symbol, side, level, price, quantity) ",
            );
            qb.push_values(chunk, |mut b, (side, level, price, quantity)| {
                b.push_bind(snapshot.time)
                    .push_bind(&snapshot.symbol)
                    .push_bind(side.as_str())
                    .push_bind(level)
                    .push_bind(price)
                    .push_bind(quantity);
            });
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}

fn candle_from_row(row: &PgRow) -> Result<Candle> {
    Ok(Candle {
        open_time: row.try_get("time")?,
        symbol: row.try_get("symbol")?,
        timeframe: row.try_get("timeframe")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
        quote_volume: row.try_get("quote_volume")?,
        trades: row.try_get("trades")?,
        taker_buy_base: row.try_get("taker_buy_base")?,
        taker_buy_quote: row.try_get("taker_buy_quote")?,
        is_closed: row.try_get("is_closed")?,
    })
}

fn side_from_str(raw: &str) -> Result<Side> {
    raw.parse()
        .map_err(|e: String| IngestError::Storage(format!("corrupt side column: {e}")))
}

#[async_trait]
impl StorageDriver for RelationalDriver {
    #[instrument(skip(self))]
    async fn init(&self) -> Result<()> {
        // Simple-protocol execution: DDL and the timescale statements must
        // not run through a prepared statement.
        for ddl in CREATE_TABLES {
            self.pool.execute(*ddl).await?;
        }
        for stmt in TIMESCALE_SETUP {
            if let Err(err) = self.pool.execute(*stmt).await {
                warn!(error = %err, "timescale setup statement skipped");
            }
        }
        info!("relational schema initialized");
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
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&version.table_name)
            .bind(&version.symbol)
            .bind(version.window_start)
            .bind(version.window_end)
            .bind(version.record_count)
            .bind(&version.checksum)
            .bind(version.created_at)
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
            "SELECT * FROM ohlcv \
             WHERE symbol = $1 AND timeframe = $2 \
               AND ($3::timestamptz IS NULL OR time >= $3) \
               AND ($4::timestamptz IS NULL OR time <= $4) \
             ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candle_from_row).collect()
    }

    async fn get_latest_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT * FROM ohlcv WHERE symbol = $1 AND timeframe = $2 \
             ORDER BY time DESC LIMIT $3",
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candle_from_row).collect()
    }

    async fn get_open_interest(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<OpenInterest>> {
        let rows = sqlx::query(
            "SELECT * FROM open_interest \
             WHERE symbol = $1 AND period = $2 \
               AND ($3::timestamptz IS NULL OR time >= $3) \
               AND ($4::timestamptz IS NULL OR time <= $4) \
             ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(period)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(OpenInterest {
                    time: row.try_get("time")?,
                    symbol: row.try_get("symbol")?,
                    period: row.try_get("period")?,
                    open_interest: row.try_get("open_interest")?,
                    open_interest_value: row.try_get("open_interest_value")?,
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
            "SELECT * FROM funding_rate \
             WHERE symbol = $1 \
               AND ($2::timestamptz IS NULL OR funding_time >= $2) \
               AND ($3::timestamptz IS NULL OR funding_time <= $3) \
             ORDER BY funding_time ASC",
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(FundingRate {
                    funding_time: row.try_get("funding_time")?,
                    symbol: row.try_get("symbol")?,
                    funding_rate: row.try_get("funding_rate")?,
                    mark_price: row.try_get("mark_price")?,
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
            "SELECT * FROM liquidation \
             WHERE symbol = $1 \
               AND ($2::timestamptz IS NULL OR time >= $2) \
               AND ($3::timestamptz IS NULL OR time <= $3) \
             ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Liquidation {
                    order_id: row.try_get("order_id")?,
                    time: row.try_get("time")?,
                    symbol: row.try_get("symbol")?,
                    side: side_from_str(row.try_get::<String, _>("side")?.as_str())?,
                    price: row.try_get("price")?,
                    quantity: row.try_get("quantity")?,
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
            "SELECT * FROM long_short_ratio \
             WHERE symbol = $1 AND period = $2 \
               AND ($3::timestamptz IS NULL OR time >= $3) \
               AND ($4::timestamptz IS NULL OR time <= $4) \
             ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(period)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(LongShortRatio {
                    time: row.try_get("time")?,
                    symbol: row.try_get("symbol")?,
                    period: row.try_get("period")?,
                    long_short_ratio: row.try_get("long_short_ratio")?,
                    long_account: row.try_get("long_account")?,
                    short_account: row.try_get("short_account")?,
                })
            })
            .collect()
    }

    async fn get_latest_order_book(&self, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT time FROM order_book WHERE symbol = $1 ORDER BY time DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        let Some(time) = latest else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT side, level, price, quantity FROM order_book \
             WHERE symbol = $1 AND time = $2 ORDER BY side, level",
        )
        .bind(symbol)
        .bind(time)
        .fetch_all(&self.pool)
        .await?;

        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for row in &rows {
            let side: String = row.try_get("side")?;
            let level = BookLevel {
                price: row.try_get::<Decimal, _>("price")?,
                quantity: row.try_get::<Decimal, _>("quantity")?,
            };
            match side.as_str() {
                "BID" => bids.push(level),
                _ => asks.push(level),
            }
        }
        Ok(Some(OrderBookSnapshot {
            symbol: symbol.to_string(),
            time,
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
            "SELECT * FROM data_versions WHERE table_name = $1 AND symbol = $2 \
             ORDER BY id DESC LIMIT $3",
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
                    window_start: row.try_get("window_start")?,
                    window_end: row.try_get("window_end")?,
                    record_count: row.try_get("record_count")?,
                    checksum: row.try_get("checksum")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn vacuum(&self) -> Result<()> {
        // VACUUM cannot run as a prepared statement.
        self.pool.execute("VACUUM ANALYZE").await?;
        Ok(())
    }

    async fn info(&self) -> Result<StorageInfo> {
        let initialized: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'ohlcv')",
        )
        .fetch_one(&self.pool)
        .await?;
        let size: i64 = sqlx::query_scalar("SELECT pg_database_size(current_database())")
            .fetch_one(&self.pool)
            .await?;
        Ok(StorageInfo {
            backend: BackendKind::Relational,
            initialized,
            size_bytes: Some(size.max(0) as u64),
        })
    }
}
