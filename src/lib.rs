//! Futures market-data collector: continuous ingestion of crypto futures
//! data (REST + WebSocket) into a time-series store with idempotent writes,
//! bounded concurrency, and failure isolation.
//!
//! The crate wires three subsystems: the ingestion engine (historical and
//! streaming collectors), the persistence layer (one interface over three
//! backends), and the resilience layer (error tracker, per-endpoint circuit
//! breakers, retry policy). All shared singletons are explicit values owned
//! by [`AppContext`] and injected where needed.

pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod exchange;
pub mod health;
pub mod models;
pub mod resilience;
pub mod storage;
pub mod utils;
pub mod validator;

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cache::RedisCache;
use crate::collector::{HistoricalCollector, StreamingCollector};
use crate::config::AppConfig;
use crate::error::{IngestError, Result};
use crate::exchange::{subscribe_streams, ExchangeClient, MarketDataSource, StreamKind};
use crate::health::{HealthCheck, HealthReport};
use crate::resilience::{BreakerRegistry, ErrorTracker};
use crate::storage::StorageDriver;
use crate::utils::time::current_timestamp;

/// Top-level dependency container, created once at startup. The tracker and
/// breaker registry are deliberately process-scoped and in-memory; their
/// state is lost on restart.
pub struct AppContext {
    pub config: AppConfig,
    pub tracker: Arc<ErrorTracker>,
    pub breakers: Arc<BreakerRegistry>,
    pub storage: Arc<dyn StorageDriver>,
    pub cache: Option<Arc<RedisCache>>,
    pub client: Arc<ExchangeClient>,
}

impl AppContext {
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        let tracker = Arc::new(ErrorTracker::new());
        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));

        let storage = storage::create_driver(&config).await?;

        // The cache is optional: a missing or unreachable cache degrades to
        // storage-only operation instead of failing startup.
        let cache = match &config.cache {
            Some(settings) => match RedisCache::connect(settings).await {
                Ok(cache) => Some(Arc::new(cache)),
                Err(err) => {
                    warn!(error = %err, "cache unavailable, continuing without it");
                    None
                }
            },
            None => None,
        };

        let client = Arc::new(ExchangeClient::new(
            config.exchange.base_url.clone(),
            config.exchange.api_key.clone(),
            config.exchange.requests_per_minute,
            Arc::clone(&breakers),
            Arc::clone(&tracker),
            config.retry_policy(),
        )?);

        Ok(Self {
            config,
            tracker,
            breakers,
            storage,
            cache,
            client,
        })
    }

    pub fn market_source(&self) -> Arc<dyn MarketDataSource> {
        Arc::clone(&self.client) as Arc<dyn MarketDataSource>
    }

    pub fn health_check(&self) -> HealthCheck {
        let symbol = self
            .config
            .collection
            .symbols
            .first()
            .cloned()
            .unwrap_or_else(|| "SOL/USDT".to_string());
        let timeframe = self
            .config
            .collection
            .timeframes
            .first()
            .cloned()
            .unwrap_or_else(|| "5m".to_string());
        HealthCheck::new(
            Arc::clone(&self.storage),
            self.cache.clone(),
            self.market_source(),
            symbol,
            timeframe,
        )
    }
}

/// `init`: create the schema and report backend info.
pub async fn run_init(ctx: &AppContext) -> Result<()> {
    ctx.storage.init().await?;
    let info = ctx.storage.info().await?;
    info!(backend = info.backend.as_str(), initialized = info.initialized, "storage ready");
    Ok(())
}

/// `collect-historical`: backfill every configured symbol over the window.
/// Streams within a symbol run concurrently; symbols run sequentially so a
/// single symbol's failure cannot starve the rest.
pub async fn run_collect_historical(
    ctx: &AppContext,
    days: Option<u32>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    ctx.storage.init().await?;

    let days = days.unwrap_or(ctx.config.collection.historical_days);
    let end = current_timestamp();
    let start = end - ChronoDuration::days(days as i64);

    let collector = HistoricalCollector::new(
        ctx.market_source(),
        Arc::clone(&ctx.storage),
        Arc::clone(&ctx.tracker),
        ctx.config.collection.clone(),
    );

    // Propagate the shutdown signal into the collectors' cancellation flag.
    let cancel = collector.cancel_handle();
    let cancel_for_signal = Arc::clone(&cancel);
    tokio::spawn(async move {
        if shutdown.changed().await.is_ok() && *shutdown.borrow() {
            cancel_for_signal.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let mut failed_symbols = 0usize;
    let symbols = ctx.config.collection.symbols.clone();
    for symbol in &symbols {
        if cancel.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(IngestError::Cancelled);
        }
        info!(%symbol, %start, %end, "backfilling symbol");
        let summary = collector.collect_all_concurrent(symbol, start, end).await;
        if summary.failed_streams() == summary.reports.len() && !summary.reports.is_empty() {
            error!(%symbol, "every stream failed for symbol");
            failed_symbols += 1;
        }
    }

    if cancel.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(IngestError::Cancelled);
    }
    if failed_symbols == symbols.len() && !symbols.is_empty() {
        return Err(IngestError::Network("backfill failed for every symbol".to_string()));
    }
    Ok(())
}

/// `stream-realtime`: subscribe to closed-candle, mark-price, and forced
/// order streams for every configured symbol, batching into storage until
/// shutdown. Intake stops first; the consumer drains its buffers before
/// returning.
pub async fn run_stream_realtime(
    ctx: &AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    ctx.storage.init().await?;

    let mut kinds: Vec<StreamKind> = ctx
        .config
        .collection
        .timeframes
        .iter()
        .map(|tf| StreamKind::Kline { timeframe: tf.clone() })
        .collect();
    kinds.push(StreamKind::MarkPrice);
    kinds.push(StreamKind::ForceOrder);

    let (ws_handle, events) = subscribe_streams(
        &ctx.config.exchange.ws_url,
        &ctx.config.collection.symbols,
        &kinds,
        Arc::clone(&ctx.tracker),
    );

    let collector = Arc::new(StreamingCollector::new(
        Arc::clone(&ctx.storage),
        ctx.cache.clone(),
        Arc::clone(&ctx.tracker),
        ctx.config.collection.ws_batch_size,
        Duration::from_millis(ctx.config.collection.ws_batch_interval_ms),
    ));
    let consumer = collector.spawn(events);

    // Block until shutdown, then stop intake before draining the consumer.
    let _ = shutdown.changed().await;
    info!("shutting down realtime streaming");
    ws_handle.stop().await;
    consumer.stop().await;
    Ok(())
}

/// `health-check`: one probe pass.
pub async fn run_health_check(ctx: &AppContext) -> HealthReport {
    ctx.health_check().check().await
}
