//! Shared fixtures for the integration suites: an in-memory storage driver,
//! a scripted exchange stub, and record builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_data_collector::error::{IngestError, Result};
use futures_data_collector::exchange::MarketDataSource;
use futures_data_collector::models::{
    BookLevel, Candle, DataVersion, FundingRate, Liquidation, LongShortRatio, OpenInterest,
    OrderBookSnapshot, Side,
};
use futures_data_collector::storage::{EmbeddedDriver, StorageDriver, StorageInfo};

pub const SYMBOL: &str = "SOL/USDT";
pub const TIMEFRAME: &str = "5m";
pub const STEP_MS: i64 = 300_000;

pub fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

pub fn dec(raw: &str) -> Decimal {
    raw.parse().unwrap()
}

pub fn candle(open_time_ms: i64) -> Candle {
    Candle {
        symbol: SYMBOL.to_string(),
        timeframe: TIMEFRAME.to_string(),
        open_time: ts(open_time_ms),
        open: dec("10.0"),
        high: dec("11.0"),
        low: dec("9.5"),
        close: dec("10.5"),
        volume: dec("1000"),
        quote_volume: dec("10500"),
        trades: 42,
        taker_buy_base: dec("500"),
        taker_buy_quote: dec("5250"),
        is_closed: true,
    }
}

pub fn open_interest(time_ms: i64) -> OpenInterest {
    OpenInterest {
        symbol: SYMBOL.to_string(),
        period: TIMEFRAME.to_string(),
        time: ts(time_ms),
        open_interest: dec("20403.63"),
        open_interest_value: dec("1505707.84"),
    }
}

pub fn liquidation(order_id: &str, time_ms: i64) -> Liquidation {
    Liquidation {
        order_id: order_id.to_string(),
        symbol: SYMBOL.to_string(),
        side: Side::Sell,
        price: dec("58.20"),
        quantity: dec("100"),
        time: ts(time_ms),
    }
}

pub async fn memory_driver() -> Arc<dyn StorageDriver> {
    let driver = EmbeddedDriver::connect(":memory:").await.unwrap();
    driver.init().await.unwrap();
    Arc::new(driver)
}

/// Storage decorator counting batch calls, for asserting flush behavior.
pub struct RecordingDriver {
    pub inner: Arc<dyn StorageDriver>,
    pub candle_batches: AtomicU32,
    pub liquidation_batches: AtomicU32,
}

impl RecordingDriver {
    pub fn new(inner: Arc<dyn StorageDriver>) -> Self {
        Self {
            inner,
            candle_batches: AtomicU32::new(0),
            liquidation_batches: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StorageDriver for RecordingDriver {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn save_candles_batch(&self, candles: &[Candle]) -> Result<u64> {
        self.candle_batches.fetch_add(1, Ordering::SeqCst);
        self.inner.save_candles_batch(candles).await
    }

    async fn save_open_interest_batch(&self, samples: &[OpenInterest]) -> Result<u64> {
        self.inner.save_open_interest_batch(samples).await
    }

    async fn save_funding_rates_batch(&self, events: &[FundingRate]) -> Result<u64> {
        self.inner.save_funding_rates_batch(events).await
    }

    async fn save_liquidations_batch(&self, orders: &[Liquidation]) -> Result<u64> {
        self.liquidation_batches.fetch_add(1, Ordering::SeqCst);
        self.inner.save_liquidations_batch(orders).await
    }

    async fn save_long_short_ratios_batch(&self, samples: &[LongShortRatio]) -> Result<u64> {
        self.inner.save_long_short_ratios_batch(samples).await
    }

    async fn save_order_book_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<u64> {
        self.inner.save_order_book_snapshot(snapshot).await
    }

    async fn save_data_version(&self, version: &DataVersion) -> Result<()> {
        self.inner.save_data_version(version).await
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        self.inner.get_candles(symbol, timeframe, start, end).await
    }

    async fn get_latest_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
    ) -> Result<Vec<Candle>> {
        self.inner.get_latest_candles(symbol, timeframe, count).await
    }

    async fn get_open_interest(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<OpenInterest>> {
        self.inner.get_open_interest(symbol, period, start, end).await
    }

    async fn get_funding_rates(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingRate>> {
        self.inner.get_funding_rates(symbol, start, end).await
    }

    async fn get_liquidations(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Liquidation>> {
        self.inner.get_liquidations(symbol, start, end).await
    }

    async fn get_long_short_ratios(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<LongShortRatio>> {
        self.inner
            .get_long_short_ratios(symbol, period, start, end)
            .await
    }

    async fn get_latest_order_book(&self, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        self.inner.get_latest_order_book(symbol).await
    }

    async fn get_data_versions(
        &self,
        table_name: &str,
        symbol: &str,
        count: u32,
    ) -> Result<Vec<DataVersion>> {
        self.inner.get_data_versions(table_name, symbol, count).await
    }

    async fn vacuum(&self) -> Result<()> {
        self.inner.vacuum().await
    }

    async fn info(&self) -> Result<StorageInfo> {
        self.inner.info().await
    }
}

/// Scripted exchange: serves a fixed candle grid with optional failure
/// injection, enough to drive the historical collector end to end.
pub struct StubExchange {
    pub grid_start_ms: i64,
    pub grid_end_ms: i64,
    pub step_ms: i64,
    /// Rows per page, regardless of the requested limit; small values force
    /// the collector through several pagination rounds.
    pub page_cap: usize,
    /// Fail this many leading calls with a retryable timeout.
    pub fail_first: AtomicU32,
    pub calls: AtomicU32,
    /// Serve one structurally invalid candle at the grid start.
    pub corrupt_first_candle: bool,
}

impl StubExchange {
    pub fn grid(grid_start_ms: i64, grid_end_ms: i64) -> Self {
        Self {
            grid_start_ms,
            grid_end_ms,
            step_ms: STEP_MS,
            page_cap: 16,
            fail_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            corrupt_first_candle: false,
        }
    }

    fn maybe_fail(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(IngestError::Timeout("injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataSource for StubExchange {
    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.maybe_fail()?;
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(self.grid_start_ms);
        let mut out = Vec::new();
        let mut cursor = self.grid_start_ms.max(since_ms);
        // Snap up to the grid.
        let offset = (cursor - self.grid_start_ms).rem_euclid(self.step_ms);
        if offset != 0 {
            cursor += self.step_ms - offset;
        }
        let page = (limit as usize).min(self.page_cap);
        while cursor <= self.grid_end_ms && out.len() < page {
            let mut c = candle(cursor);
            if self.corrupt_first_candle && cursor == self.grid_start_ms {
                c.high = dec("5.0");
                c.low = dec("6.0");
                c.open = dec("10.0");
                c.close = dec("7.0");
            }
            out.push(c);
            cursor += self.step_ms;
        }
        Ok(out)
    }

    async fn fetch_open_interest_hist(
        &self,
        _symbol: &str,
        _period: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<OpenInterest>> {
        self.maybe_fail()?;
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(self.grid_start_ms);
        let mut out = Vec::new();
        let mut cursor = self.grid_start_ms.max(since_ms);
        let offset = (cursor - self.grid_start_ms).rem_euclid(self.step_ms);
        if offset != 0 {
            cursor += self.step_ms - offset;
        }
        let page = (limit as usize).min(self.page_cap);
        while cursor <= self.grid_end_ms && out.len() < page {
            out.push(open_interest(cursor));
            cursor += self.step_ms;
        }
        Ok(out)
    }

    async fn fetch_funding_rate(
        &self,
        _symbol: &str,
        _start_time: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> Result<Vec<FundingRate>> {
        self.maybe_fail()?;
        Ok(Vec::new())
    }

    async fn fetch_liquidations(&self, _symbol: &str, _limit: u32) -> Result<Vec<Liquidation>> {
        self.maybe_fail()?;
        Ok(vec![
            liquidation("90001", self.grid_start_ms),
            liquidation("90002", self.grid_start_ms + self.step_ms),
        ])
    }

    async fn fetch_top_trader_ratio(
        &self,
        _symbol: &str,
        _period: &str,
        _since: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> Result<Vec<LongShortRatio>> {
        self.maybe_fail()?;
        Ok(Vec::new())
    }

    async fn fetch_order_book(&self, symbol: &str, _depth: u32) -> Result<OrderBookSnapshot> {
        self.maybe_fail()?;
        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            time: ts(self.grid_end_ms),
            bids: vec![BookLevel { price: dec("100.00"), quantity: dec("1000") }],
            asks: vec![BookLevel { price: dec("100.05"), quantity: dec("800") }],
        })
    }

    async fn server_time(&self) -> Result<DateTime<Utc>> {
        Ok(ts(self.grid_end_ms))
    }
}
