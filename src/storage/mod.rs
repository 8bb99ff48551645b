//! Pluggable persistence over three backends sharing one interface.
//!
//! Batch writes are idempotent: re-submitting a batch never duplicates rows
//! and never raises. Range reads are inclusive of both bounds and ordered by
//! the entity's time column ascending. Writers report the number of rows
//! that were new, so callers can observe idempotence directly.

pub mod cloud_doc;
pub mod embedded;
pub mod relational;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{AppConfig, DatabaseType};
use crate::error::Result;
use crate::models::{
    Candle, DataVersion, FundingRate, Liquidation, LongShortRatio, OpenInterest,
    OrderBookSnapshot,
};

pub use cloud_doc::CloudDocDriver;
pub use embedded::EmbeddedDriver;
pub use relational::RelationalDriver;

/// Rows per statement; sized to fit comfortably under backend limits.
pub(crate) const WRITE_CHUNK_SIZE: usize = 1000;
/// Hard timeout for one storage write.
pub(crate) const STORAGE_WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendKind {
    Relational,
    EmbeddedFile,
    CloudDoc,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Relational => "relational",
            BackendKind::EmbeddedFile => "embedded_file",
            BackendKind::CloudDoc => "cloud_doc",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub backend: BackendKind,
    pub initialized: bool,
    pub size_bytes: Option<u64>,
}

/// Uniform persistence interface over the relational, embedded-file, and
/// cloud-document backends.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Creates the schema (or structural equivalent). Idempotent.
    async fn init(&self) -> Result<()>;

    /// Upserts a candle batch; an in-progress candle is rewritten on the
    /// next pass. Returns the number of newly inserted rows.
    async fn save_candles_batch(&self, candles: &[Candle]) -> Result<u64>;

    /// Upserts open-interest samples, last writer wins.
    async fn save_open_interest_batch(&self, samples: &[OpenInterest]) -> Result<u64>;

    /// Appends funding events; existing (funding_time, symbol) rows are
    /// left untouched.
    async fn save_funding_rates_batch(&self, events: &[FundingRate]) -> Result<u64>;

    /// Appends liquidations; duplicate order ids are silently ignored.
    async fn save_liquidations_batch(&self, orders: &[Liquidation]) -> Result<u64>;

    /// Upserts long/short ratio samples.
    async fn save_long_short_ratios_batch(&self, samples: &[LongShortRatio]) -> Result<u64>;

    /// Full-replace of the snapshot at its timestamp.
    async fn save_order_book_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<u64>;

    /// Appends one backfill version row.
    async fn save_data_version(&self, version: &DataVersion) -> Result<()>;

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>>;

    /// Most recent `count` candles, newest first.
    async fn get_latest_candles(&self, symbol: &str, timeframe: &str, count: u32)
        -> Result<Vec<Candle>>;

    async fn get_open_interest(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<OpenInterest>>;

    async fn get_funding_rates(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FundingRate>>;

    async fn get_liquidations(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Liquidation>>;

    async fn get_long_short_ratios(
        &self,
        symbol: &str,
        period: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<LongShortRatio>>;

    /// The most recent snapshot for the symbol, if any.
    async fn get_latest_order_book(&self, symbol: &str) -> Result<Option<OrderBookSnapshot>>;

    /// Most recent version rows for a table/symbol pair, newest first.
    async fn get_data_versions(
        &self,
        table_name: &str,
        symbol: &str,
        count: u32,
    ) -> Result<Vec<DataVersion>>;

    /// Backend-specific maintenance; a no-op is acceptable.
    async fn vacuum(&self) -> Result<()>;

    async fn info(&self) -> Result<StorageInfo>;
}

/// Runs a storage write under the hard timeout with a single retry. A
/// second failure surfaces unchanged.
pub(crate) async fn with_storage_guard<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::error::IngestError;

    let mut last: Option<IngestError> = None;
    for attempt in 0..2u8 {
        match tokio::time::timeout(STORAGE_WRITE_TIMEOUT, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if err.is_retryable() && attempt == 0 => {
                tracing::warn!(error = %err, "storage write failed, retrying once");
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                last = Some(err);
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let err = IngestError::Timeout("storage write".to_string());
                if attempt == 0 {
                    tracing::warn!("storage write timed out, retrying once");
                    last = Some(err);
                } else {
                    return Err(err);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| IngestError::Storage("retry budget exhausted".to_string())))
}

/// Builds the driver selected by `database_type`. The driver is returned
/// uninitialized; callers run [`StorageDriver::init`] explicitly.
pub async fn create_driver(config: &AppConfig) -> Result<Arc<dyn StorageDriver>> {
    let chunk = config.collection.batch_size;
    match config.database_type {
        DatabaseType::Relational => Ok(Arc::new(
            RelationalDriver::connect(&config.database)
                .await?
                .with_write_chunk(chunk),
        )),
        DatabaseType::EmbeddedFile => Ok(Arc::new(
            EmbeddedDriver::connect(&config.embedded.path)
                .await?
                .with_write_chunk(chunk),
        )),
        DatabaseType::CloudDoc => Ok(Arc::new(CloudDocDriver::new(&config.cloud)?)),
    }
}
