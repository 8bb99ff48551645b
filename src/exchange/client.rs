//! Typed REST client for the futures exchange.
//!
//! Every fetch goes through the same path: token-bucket acquire, then
//! Retry(Breaker(HTTP call)), then one-shot decoding into typed records.
//! Failures land in the error tracker under `api_<resource>_error`. Empty
//! results come back as empty vectors, never as errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{IngestError, Result};
use crate::exchange::rate_limit::RateLimiter;
use crate::exchange::wire;
use crate::exchange::{to_exchange_symbol, MarketDataSource, VALID_DEPTH_LIMITS};
use crate::models::{
    Candle, FundingRate, Liquidation, LongShortRatio, OpenInterest, OrderBookSnapshot,
};
use crate::resilience::{BreakerRegistry, ErrorTracker, RetryPolicy, Severity};
use crate::utils::time::{current_timestamp, datetime_to_ms};

/// Hard timeout for every outbound request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Global request budget per minute.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 1200;

pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: RateLimiter,
    registry: Arc<BreakerRegistry>,
    tracker: Arc<ErrorTracker>,
    retry: RetryPolicy,
}

impl ExchangeClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        requests_per_minute: u32,
        registry: Arc<BreakerRegistry>,
        tracker: Arc<ErrorTracker>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            limiter: RateLimiter::per_minute(requests_per_minute),
            registry,
            tracker,
            retry,
        })
    }

    async fn send_request(&self, path: &str, query: Vec<(String, String)>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url).query(&query);
        if let Some(key) = &self.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(IngestError::from_status(status.as_u16(), snippet));
        }
        Ok(response.json::<Value>().await?)
    }

    /// Rate limit, then Retry(Breaker(request)). The breaker is per resource,
    /// so a failing endpoint opens without affecting the others.
    #[instrument(skip(self, query))]
    async fn get_json(
        &self,
        resource: &'static str,
        path: &str,
        query: Vec<(String, String)>,
    ) -> Result<Value> {
        self.limiter.acquire().await;
        let breaker = self.registry.get_or_create(resource);

        let result = self
            .retry
            .run(|| {
                let breaker = Arc::clone(&breaker);
                let query = query.clone();
                async move { breaker.call(|| self.send_request(path, query)).await }
            })
            .await;

        if let Err(err) = &result {
            let severity = match err {
                IngestError::ExchangeClient { .. } | IngestError::Malformed(_) => Severity::Warning,
                _ => Severity::Error,
            };
            self.tracker
                .record(&format!("api_{resource}_error"), &err.to_string(), path, severity);
        }
        result
    }
}

#[async_trait]
impl MarketDataSource for ExchangeClient {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let mut query = vec![
            ("symbol".to_string(), to_exchange_symbol(symbol)),
            ("interval".to_string(), timeframe.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime".to_string(), datetime_to_ms(since).to_string()));
        }
        let value = self.get_json("ohlcv", "/fapi/v1/klines", query).await?;
        let candles = wire::parse_klines(value, symbol, timeframe, current_timestamp())?;
        debug!(symbol, timeframe, count = candles.len(), "fetched candles");
        Ok(candles)
    }

    async fn fetch_open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<OpenInterest>> {
        let mut query = vec![
            ("symbol".to_string(), to_exchange_symbol(symbol)),
            ("period".to_string(), period.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime".to_string(), datetime_to_ms(since).to_string()));
        }
        let value = self
            .get_json("open_interest", "/futures/data/openInterestHist", query)
            .await?;
        wire::parse_open_interest(value, symbol, period)
    }

    async fn fetch_funding_rate(
        &self,
        symbol: &str,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<FundingRate>> {
        let mut query = vec![
            ("symbol".to_string(), to_exchange_symbol(symbol)),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(start) = start_time {
            query.push(("startTime".to_string(), datetime_to_ms(start).to_string()));
        }
        let value = self.get_json("funding", "/fapi/v1/fundingRate", query).await?;
        wire::parse_funding_rates(value, symbol)
    }

    async fn fetch_liquidations(&self, symbol: &str, limit: u32) -> Result<Vec<Liquidation>> {
        let query = vec![
            ("symbol".to_string(), to_exchange_symbol(symbol)),
            ("limit".to_string(), limit.to_string()),
        ];
        let value = self
            .get_json("liquidations", "/fapi/v1/allForceOrders", query)
            .await?;
        wire::parse_liquidations(value, symbol)
    }

    async fn fetch_top_trader_ratio(
        &self,
        symbol: &str,
        period: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<LongShortRatio>> {
        let mut query = vec![
            ("symbol".to_string(), to_exchange_symbol(symbol)),
            ("period".to_string(), period.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime".to_string(), datetime_to_ms(since).to_string()));
        }
        let value = self
            .get_json("trader_ratio", "/futures/data/topLongShortAccountRatio", query)
            .await?;
        wire::parse_long_short_ratios(value, symbol, period)
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> Result<OrderBookSnapshot> {
        if !VALID_DEPTH_LIMITS.contains(&depth) {
            return Err(IngestError::Validation(format!(
                "depth {depth} not in {VALID_DEPTH_LIMITS:?}"
            )));
        }
        let query = vec![
            ("symbol".to_string(), to_exchange_symbol(symbol)),
            ("limit".to_string(), depth.to_string()),
        ];
        let value = self.get_json("depth", "/fapi/v1/depth", query).await?;
        wire::parse_order_book(value, symbol, current_timestamp())
    }

    async fn server_time(&self) -> Result<DateTime<Utc>> {
        let value = self.get_json("server_time", "/fapi/v1/time", vec![]).await?;
        wire::parse_server_time(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ExchangeClient {
        ExchangeClient::new(
            "http://localhost:9",
            None,
            DEFAULT_REQUESTS_PER_MINUTE,
            Arc::new(BreakerRegistry::default()),
            Arc::new(ErrorTracker::new()),
            RetryPolicy { max_retries: 0, ..RetryPolicy::default() },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_depth_rejected_before_any_request() {
        let err = client().fetch_order_book("SOL/USDT", 42).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
