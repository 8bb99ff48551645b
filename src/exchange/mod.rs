//! Exchange access layer: typed REST calls and WebSocket subscriptions.
//!
//! Everything above this module consumes typed records only; wire formats are
//! decoded once in [`wire`]. Every REST call is token-bucket rate limited and
//! wrapped Retry(Breaker(call)), with failures recorded into the error
//! tracker under `api_<resource>_error`.

pub mod client;
pub mod rate_limit;
pub mod streams;
pub mod wire;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Candle, FundingRate, Liquidation, LongShortRatio, OpenInterest, OrderBookSnapshot,
};

pub use client::ExchangeClient;
pub use rate_limit::RateLimiter;
pub use streams::{subscribe_streams, ConnectionState, StreamHandle};

/// Depth levels the exchange accepts for a depth snapshot.
pub const VALID_DEPTH_LIMITS: [u32; 7] = [5, 10, 20, 50, 100, 500, 1000];

/// WebSocket stream kinds the streaming collector consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// Closed-candle stream for one timeframe.
    Kline { timeframe: String },
    MarkPrice,
    ForceOrder,
}

impl StreamKind {
    /// Stream name suffix as it appears in the multiplexed URL.
    pub fn suffix(&self) -> String {
        match self {
            StreamKind::Kline { timeframe } => format!("kline_{timeframe}"),
            StreamKind::MarkPrice => "markPrice".to_string(),
            StreamKind::ForceOrder => "forceOrder".to_string(),
        }
    }
}

/// "SOL/USDT" -> "SOLUSDT". The canonical slash form is used everywhere
/// inside the pipeline; the exchange form only at the wire boundary.
pub fn to_exchange_symbol(canonical: &str) -> String {
    canonical.replace('/', "").to_uppercase()
}

/// "SOL/USDT" -> "solusdt", the form stream names are built from.
pub fn to_stream_symbol(canonical: &str) -> String {
    canonical.replace('/', "").to_lowercase()
}

/// Typed market-data source. Implemented by [`ExchangeClient`] and by test
/// stubs driving the collectors.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Candles ordered by close time ascending. `since` filters to open
    /// times at or after the instant.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>>;

    /// Open-interest samples ascending.
    async fn fetch_open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<OpenInterest>>;

    /// Funding events ascending.
    async fn fetch_funding_rate(
        &self,
        symbol: &str,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<FundingRate>>;

    /// Most recent forced orders.
    async fn fetch_liquidations(&self, symbol: &str, limit: u32) -> Result<Vec<Liquidation>>;

    /// Top-trader long/short account ratio samples ascending.
    async fn fetch_top_trader_ratio(
        &self,
        symbol: &str,
        period: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<LongShortRatio>>;

    /// Depth snapshot. `depth` must be one of [`VALID_DEPTH_LIMITS`].
    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> Result<OrderBookSnapshot>;

    /// Exchange server time; used by the health check as a reachability probe.
    async fn server_time(&self) -> Result<DateTime<Utc>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalization() {
        assert_eq!(to_exchange_symbol("SOL/USDT"), "SOLUSDT");
        assert_eq!(to_exchange_symbol("btc/usdt"), "BTCUSDT");
        assert_eq!(to_stream_symbol("SOL/USDT"), "solusdt");
    }

    #[test]
    fn test_stream_suffixes() {
        let kline = StreamKind::Kline { timeframe: "5m".into() };
        assert_eq!(kline.suffix(), "kline_5m");
        assert_eq!(StreamKind::MarkPrice.suffix(), "markPrice");
        assert_eq!(StreamKind::ForceOrder.suffix(), "forceOrder");
    }
}
