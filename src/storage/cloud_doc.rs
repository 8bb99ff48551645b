//! Cloud document backend: a hierarchical JSON store spoken over REST
//! (Realtime-Database style).
//!
//! Records live in per-symbol subtrees keyed by timestamp-as-string, e.g.
//! `/ohlcv/SOL_USDT/5m/1700000000000`. Canonical symbols keep their slash at
//! the interface; path keys replace it with `_`. PATCH/PUT semantics make
//! every write idempotent by construction; append-only entities skip keys
//! that already exist instead of overwriting them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::CloudSettings;
use crate::error::{IngestError, Result};
use crate::models::{
    Candle, DataVersion, FundingRate, Liquidation, LongShortRatio, OpenInterest,
    OrderBookSnapshot,
};
use crate::storage::{with_storage_guard, BackendKind, StorageDriver, StorageInfo};
use crate::utils::time::datetime_to_ms;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn symbol_key(symbol: &str) -> String {
    symbol.replace('/', "_")
}

fn ms_key(ts: DateTime<Utc>) -> String {
    datetime_to_ms(ts).to_string()
}

fn storage_err(context: &str, detail: impl std::fmt::Display) -> IngestError {
    IngestError::Storage(format!("{context}: {detail}"))
}

pub struct CloudDocDriver {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    initialized: AtomicBool,
}

impl CloudDocDriver {
    pub fn new(settings: &CloudSettings) -> Result<Self> {
        let auth_token = match &settings.credentials_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map(|raw| raw.trim().to_string())
                    .map_err(|e| IngestError::Config(format!("read credentials {path}: {e}")))?,
            ),
            None => None,
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            auth_token,
            initialized: AtomicBool::new(false),
        })
    }

    fn node_url(&self, segments: &[&str]) -> String {
        format!("{}/{}.json", self.base_url, segments.join("/"))
    }

    fn base_query(&self) -> Vec<(String, String)> {
        match &self.auth_token {
            Some(token) => vec![("auth".to_string(), token.clone())],
            None => Vec::new(),
        }
    }

    async fn get_node<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        extra: &[(&str, String)],
    ) -> Result<Option<T>> {
        let mut query = self.base_query();
        for (k, v) in extra {
            query.push((k.to_string(), v.clone()));
        }
        let url = self.node_url(segments);
        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| storage_err("cloud get", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(storage_err("cloud get", format!("{url} -> {status}")));
        }
        let value: Value = response.json().await.map_err(|e| storage_err("cloud get", e))?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| storage_err("cloud decode", e))
    }

    async fn write_node(&self, method: reqwest::Method, segments: &[&str], body: &Value) -> Result<()> {
        let url = self.node_url(segments);
        let response = self
            .http
            .request(method, &url)
            .query(&self.base_query())
            .json(body)
            .send()
            .await
            .map_err(|e| storage_err("cloud write", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(storage_err("cloud write", format!("{url} -> {status}")));
        }
        Ok(())
    }

    /// Keys of a node's direct children without their payloads.
    async fn shallow_keys(&self, segments: &[&str]) -> Result<HashSet<String>> {
        let keys: Option<HashMap<String, Value>> = self
            .get_node(segments, &[("shallow", "true".to_string())])
            .await?;
        Ok(keys.map(|m| m.into_keys().collect()).unwrap_or_default())
    }

    /// Upserts `entries` under `segments`, returning the number of keys
    /// that were new. When `overwrite` is false existing keys are skipped
    /// (append-only entities).
    async fn merge_children(
        &self,
        segments: &[&str],
        entries: BTreeMap<String, Value>,
        overwrite: bool,
    ) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let existing = self.shallow_keys(segments).await?;
        let new_count = entries.keys().filter(|k| !existing.contains(*k)).count() as u64;

        let to_write: Map<String, Value> = if overwrite {
            entries.into_iter().collect()
        } else {
            entries
                .into_iter()
                .filter(|(k, _)| !existing.contains(k))
                .collect()
        };
        if to_write.is_empty() {
            return Ok(0);
        }
        self.write_node(reqwest::Method::PATCH, segments, &Value::Object(to_write))
            .await?;
        Ok(new_count)
    }

    /// Range read over timestamp keys, inclusive bounds, ascending.
    async fn read_range<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<(i64, T)>> {
        let mut extra = vec![("orderBy", "\"$key\"".to_string())];
        if let Some(start) = start {
            extra.push(("startAt", format!("\"{}\"", datetime_to_ms(start))));
        }
        if let Some(end) = end {
            extra.push(("endAt", format!("\"{}\"", datetime_to_ms(end))));
        }
        let node: Option<HashMap<String, T>> = self.get_node(segments, &extra).await?;
        let mut rows: Vec<(i64, T)> = node
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| key.parse::<i64>().ok().map(|ms| (ms, value)))
            .collect();
        rows.sort_by_key(|(ms, _)| *ms);
        Ok(rows)
    }
}

#[async_trait]
impl StorageDriver for CloudDocDriver {
    #[instrument(skip(self))]
    async fn init(&self) -> Result<()> {
        // No schema to create; probe the root so bad URLs and credentials
        // fail at startup rather than on the first batch.
        let _: Option<HashMap<String, Value>> = self
            .get_node(&["ohlcv"], &[("shallow", "true".to_string())])
            .await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!(url = %self.base_url, "cloud document store reachable");
        Ok(())
    }

    async fn save_candles_batch(&self, candles: &[Candle]) -> Result<u64> {
        let mut groups: HashMap<(String, String), BTreeMap<String, Value>> = HashMap::new();
        for candle in candles {
            groups
                .entry((symbol_key(&candle.symbol), candle.timeframe.clone()))
                .or_default()
                .insert(ms_key(candle.open_time), serde_json::to_value(candle)?);
        }
        with_storage_guard(|| async {
            let mut new_rows = 0u64;
            for ((symbol, timeframe), entries) in &groups {
                new_rows += self
                    .merge_children(&["ohlcv", symbol, timeframe], entries.clone(), true)
                    .await?;
            }
            Ok(new_rows)
        })
        .await
    }

    async fn save_open_interest_batch(&self, samples: &[OpenInterest]) -> Result<u64> {
        let mut groups: HashMap<(String, String), BTreeMap<String, Value>> = HashMap::new();
        for sample in samples {
            groups
                .entry((symbol_key(&sample.symbol), sample.period.clone()))
                .or_default()
                .insert(ms_key(sample.time), serde_json::to_value(sample)?);
        }
        with_storage_guard(|| async {
            let mut new_rows = 0u64;
            for ((symbol, period), entries) in &groups {
                new_rows += self
                    .merge_children(&["open_interest", symbol, period], entries.clone(), true)
                    .await?;
            }
            Ok(new_rows)
        })
        .await
    }

    async fn save_funding_rates_batch(&self, events: &[FundingRate]) -> Result<u64> {
        let mut groups: HashMap<String, BTreeMap<String, Value>> = HashMap::new();
        for event in events {
            groups
                .entry(symbol_key(&event.symbol))
                .or_default()
                .insert(ms_key(event.funding_time), serde_json::to_value(event)?);
        }
        with_storage_guard(|| async {
            let mut new_rows = 0u64;
            for (symbol, entries) in &groups {
                // Funding history is immutable; never rewrite a window.
                new_rows += self
                    .merge_children(&["funding_rate", symbol], entries.clone(), false)
                    .await?;
            }
            Ok(new_rows)
        })
        .await
    }

    async fn save_liquidations_batch(&self, orders: &[Liquidation]) -> Result<u64> {
        let mut groups: HashMap<String, BTreeMap<String, Value>> = HashMap::new();
        for order in orders {
            groups
                .entry(symbol_key(&order.symbol))
                .or_default()
                .insert(order.order_id.clone(), serde_json::to_value(order)?);
        }
        with_storage_guard(|| async {
            let mut new_rows = 0u64;
            for (symbol, entries) in &groups {
                new_rows += self
                    .merge_children(&["liquidation", symbol], entries.clone(), false)
                    .await?;
            }
            Ok(new_rows)
        })
        .await
    }

    async fn save_long_short_ratios_batch(&self, samples: &[LongShortRatio]) -> Result<u64> {
        let mut groups: HashMap<(String, String), BTreeMap<String, Value>> = HashMap::new();
        for sample in samples {
            groups
                .entry((symbol_key(&sample.symbol), sample.period.clone()))
                .or_default()
                .insert(ms_key(sample.time), serde_json::to_value(sample)?);
        }
        with_storage_guard(|| async {
            let mut new_rows = 0u64;
            for ((symbol, period), entries) in &groups {
                new_rows += self
                    .merge_children(&["long_short_ratio", symbol, period], entries.clone(), true)
                    .await?;
            }
            Ok(new_rows)
        })
        .await
    }

    async fn save_order_book_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<u64> {
        let symbol = symbol_key(&snapshot.symbol);
        let key = ms_key(snapshot.time);
        let body = serde_json::to_value(snapshot)?;
        with_storage_guard(|| async {
            // PUT replaces the whole snapshot subtree at this timestamp.
            self.write_node(reqwest::Method::PUT, &["order_book", &symbol, &key], &body)
                .await?;
            Ok((snapshot.bids.len() + snapshot.asks.len()) as u64)
        })
        .await
    }

    async fn save_data_version(&self, version: &DataVersion) -> Result<()> {
        let symbol = symbol_key(&version.symbol);
        let body = serde_json::to_value(version)?;
        with_storage_guard(|| async {
            // POST appends under a store-generated key: a monotonic log.
            let url = self.node_url(&["data_versions", &version.table_name, &symbol]);
            let response = self
                .http
                .post(&url)
                .query(&self.base_query())
                .json(&body)
                .send()
                .await
                .map_err(|e| storage_err("cloud write", e))?;
            if !response.status().is_success() {
                return Err(storage_err("cloud write", format!("{url} -> {}", response.status())));
            }
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
        let key = symbol_key(symbol);
        let rows: Vec<(i64, Candle)> = self
            .read_range(&["ohlcv", &key, timeframe], start, end)
            .await?;
        Ok(rows.into_iter().map(|(_, c)| c).collect())
    }

    async fn get_latest_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
    ) -> Result<Vec<Candle>> {
        let key = symbol_key(symbol);
        let extra = vec![
            ("orderBy", "\"$key\"".to_string()),
            ("limitToLast", count.to_string()),
        ];
        let node: Option<HashMap<String, Candle>> =
            self.get_node(&["ohlcv", &key, timeframe], &extra).await?;
        let mut rows: Vec<Candle> = node.unwrap_or_default().into_values().collect();
        rows.sort_by_key(|c| std::cmp::Reverse(c.open_time));
        Ok(rows)
    }

    async fn get_open_interest(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<OpenInterest>> {
        let key = symbol_key(symbol);
        let rows: Vec<(i64, OpenInterest)> = self
            .read_range(&["open_interest", &key, period], start, end)
            .await?;
        Ok(rows.into_iter().map(|(_, s)| s).collect())
    }

    async fn get_funding_rates(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingRate>> {
        let key = symbol_key(symbol);
        let rows: Vec<(i64, FundingRate)> =
            self.read_range(&["funding_rate", &key], start, end).await?;
        Ok(rows.into_iter().map(|(_, e)| e).collect())
    }

    async fn get_liquidations(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Liquidation>> {
        // Liquidations are keyed by order id, not time; filter client-side.
        let key = symbol_key(symbol);
        let node: Option<HashMap<String, Liquidation>> =
            self.get_node(&["liquidation", &key], &[]).await?;
        let mut rows: Vec<Liquidation> = node
            .unwrap_or_default()
            .into_values()
            .filter(|o| start.map_or(true, |s| o.time >= s) && end.map_or(true, |e| o.time <= e))
            .collect();
        rows.sort_by_key(|o| o.time);
        Ok(rows)
    }

    async fn get_long_short_ratios(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<LongShortRatio>> {
        let key = symbol_key(symbol);
        let rows: Vec<(i64, LongShortRatio)> = self
            .read_range(&["long_short_ratio", &key, period], start, end)
            .await?;
        Ok(rows.into_iter().map(|(_, s)| s).collect())
    }

    async fn get_latest_order_book(&self, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        let key = symbol_key(symbol);
        let keys = self.shallow_keys(&["order_book", &key]).await?;
        let latest = keys
            .into_iter()
            .filter_map(|k| k.parse::<i64>().ok())
            .max();
        let Some(latest) = latest else {
            return Ok(None);
        };
        self.get_node(&["order_book", &key, &latest.to_string()], &[])
            .await
    }

    async fn get_data_versions(
        &self,
        table_name: &str,
        symbol: &str,
        count: u32,
    ) -> Result<Vec<DataVersion>> {
        let key = symbol_key(symbol);
        let node: Option<HashMap<String, DataVersion>> = self
            .get_node(&["data_versions", table_name, &key], &[])
            .await?;
        let mut rows: Vec<DataVersion> = node.unwrap_or_default().into_values().collect();
        rows.sort_by_key(|v| std::cmp::Reverse(v.created_at));
        rows.truncate(count as usize);
        Ok(rows)
    }

    async fn vacuum(&self) -> Result<()> {
        // The store compacts itself; nothing to do.
        Ok(())
    }

    async fn info(&self) -> Result<StorageInfo> {
        Ok(StorageInfo {
            backend: BackendKind::CloudDoc,
            initialized: self.initialized.load(Ordering::SeqCst),
            size_bytes: None,
        })
    }
}
