//! Historical backfill: cursor-paginated collection of every stream for a
//! (symbol, window) pair.
//!
//! Per stream, pages are pulled from the exchange ascending from the window
//! start, buffered, deduplicated by entity key, clipped to the window end,
//! validated, and handed to the storage driver as one batch. A version row
//! with a deterministic content hash is appended on success. A stream whose
//! circuit opens is skipped for the rest of the run and reported partial;
//! the remaining streams are unaffected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::collector::{CollectionSummary, StreamReport};
use crate::config::CollectionSettings;
use crate::error::{IngestError, Result};
use crate::exchange::MarketDataSource;
use crate::models::DataVersion;
use crate::resilience::ErrorTracker;
use crate::storage::StorageDriver;
use crate::utils::time::{current_timestamp, interval_duration};
use crate::validator;

// Natural page sizes per resource.
const CANDLE_PAGE_LIMIT: u32 = 1500;
const OI_PAGE_LIMIT: u32 = 500;
const FUNDING_PAGE_LIMIT: u32 = 1000;
const RATIO_PAGE_LIMIT: u32 = 500;
const LIQUIDATION_FETCH_LIMIT: u32 = 1000;

// Per-endpoint spacing between pages.
const CANDLE_PAGE_SPACING: Duration = Duration::from_millis(200);
const OI_PAGE_SPACING: Duration = Duration::from_millis(300);

/// Pause before resuming at the same cursor after exhausted retries.
const FAILURE_PAUSE: Duration = Duration::from_secs(2);

/// Funding settles every 8 hours.
const FUNDING_INTERVAL_HOURS: i64 = 8;

pub struct HistoricalCollector {
    source: Arc<dyn MarketDataSource>,
    storage: Arc<dyn StorageDriver>,
    tracker: Arc<ErrorTracker>,
    settings: CollectionSettings,
    cancelled: Arc<AtomicBool>,
}

fn content_checksum<T: Serialize>(records: &[T]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        if let Ok(line) = serde_json::to_vec(record) {
            hasher.update(&line);
            hasher.update(b"\n");
        }
    }
    format!("{:x}", hasher.finalize())
}

impl HistoricalCollector {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        storage: Arc<dyn StorageDriver>,
        tracker: Arc<ErrorTracker>,
        settings: CollectionSettings,
    ) -> Self {
        Self {
            source,
            storage,
            tracker,
            settings,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag observed once per page; flipping it stops every stream
    /// within its current iteration.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Pulls pages from `fetch` until the window is covered, the stream's
    /// circuit opens, or the run is cancelled. Returns the raw buffer, the
    /// page count, and whether the stream ended early.
    async fn fetch_window<T, F, Fut>(
        &self,
        stream: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: chrono::Duration,
        spacing: Duration,
        mut fetch: F,
        time_of: impl Fn(&T) -> DateTime<Utc>,
    ) -> (Vec<T>, u32, bool)
    where
        F: FnMut(DateTime<Utc>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<T>>>,
    {
        let mut buffer = Vec::new();
        let mut cursor = start;
        let mut pages: u32 = 0;
        let mut partial = false;

        loop {
            if self.is_cancelled() {
                partial = true;
                break;
            }
            if cursor > end {
                break;
            }
            match fetch(cursor).await {
                Ok(batch) => {
                    let Some(last) = batch.last().map(&time_of) else {
                        break;
                    };
                    pages += 1;
                    buffer.extend(batch);
                    if last >= end || last + step <= cursor {
                        break;
                    }
                    cursor = last + step;
                    sleep(spacing).await;
                }
                Err(IngestError::CircuitOpen { endpoint }) => {
                    warn!(stream, %endpoint, "circuit open, skipping stream for this run");
                    self.tracker.record_error(
                        &IngestError::CircuitOpen { endpoint },
                        stream,
                    );
                    partial = true;
                    break;
                }
                Err(err) if err.is_retryable() => {
                    // Retry and breaker budgets are already spent; pause and
                    // resume at the same cursor.
                    self.tracker.record_error(&err, stream);
                    sleep(FAILURE_PAUSE).await;
                }
                Err(err) => {
                    self.tracker.record_error(&err, stream);
                    partial = true;
                    break;
                }
            }
        }
        (buffer, pages, partial)
    }

    async fn finish_stream<T: Serialize>(
        &self,
        mut report: StreamReport,
        table_name: &str,
        symbol: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
        batch: &[T],
        validation: validator::ValidationReport,
        save: impl std::future::Future<Output = Result<u64>>,
    ) -> StreamReport {
        if validation.is_fatal() {
            for finding in &validation.fatal {
                self.tracker.record_error(&IngestError::Validation(finding.clone()), &report.stream);
            }
            report.error = Some(format!("validation rejected batch: {}", validation.fatal.join("; ")));
            return report;
        }
        for finding in &validation.warnings {
            warn!(stream = %report.stream, %finding, "validation warning");
        }

        match save.await {
            Ok(rows) => {
                report.rows_written = rows;
                let version = DataVersion {
                    table_name: table_name.to_string(),
                    symbol: symbol.to_string(),
                    window_start: window.0,
                    window_end: window.1,
                    record_count: batch.len() as i64,
                    checksum: content_checksum(batch),
                    created_at: current_timestamp(),
                };
                if let Err(err) = self.storage.save_data_version(&version).await {
                    self.tracker.record_error(&err, &report.stream);
                    report.error = Some(err.to_string());
                }
            }
            Err(err) => {
                self.tracker.record_error(&err, &report.stream);
                report.error = Some(err.to_string());
            }
        }
        report
    }

    #[instrument(skip(self))]
    pub async fn collect_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StreamReport {
        let mut report = StreamReport::named(format!("ohlcv_{timeframe}"));
        let step = match interval_duration(timeframe) {
            Ok(step) => step,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };

        let (raw, pages, partial) = self
            .fetch_window(
                &report.stream.clone(),
                start,
                end,
                step,
                CANDLE_PAGE_SPACING,
                |cursor| self.source.fetch_ohlcv(symbol, timeframe, Some(cursor), CANDLE_PAGE_LIMIT),
                |c| c.open_time,
            )
            .await;
        report.pages = pages;
        report.partial = partial;

        // Dedupe by key (last observation wins) and clip to the window.
        let mut by_key = BTreeMap::new();
        for candle in raw {
            if candle.open_time >= start && candle.open_time <= end {
                by_key.insert(candle.open_time, candle);
            }
        }
        let batch: Vec<_> = by_key.into_values().collect();
        let validation = validator::check_candles(&batch);
        self.finish_stream(
            report,
            "ohlcv",
            symbol,
            (start, end),
            &batch,
            validation,
            self.storage.save_candles_batch(&batch),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn collect_open_interest(
        &self,
        symbol: &str,
        period: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StreamReport {
        let mut report = StreamReport::named(format!("open_interest_{period}"));
        let step = match interval_duration(period) {
            Ok(step) => step,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };

        let (raw, pages, partial) = self
            .fetch_window(
                &report.stream.clone(),
                start,
                end,
                step,
                OI_PAGE_SPACING,
                |cursor| {
                    self.source
                        .fetch_open_interest_hist(symbol, period, Some(cursor), OI_PAGE_LIMIT)
                },
                |s| s.time,
            )
            .await;
        report.pages = pages;
        report.partial = partial;

        let mut by_key = BTreeMap::new();
        for sample in raw {
            if sample.time >= start && sample.time <= end {
                by_key.insert(sample.time, sample);
            }
        }
        let batch: Vec<_> = by_key.into_values().collect();
        let validation = validator::check_open_interest(&batch);
        self.finish_stream(
            report,
            "open_interest",
            symbol,
            (start, end),
            &batch,
            validation,
            self.storage.save_open_interest_batch(&batch),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn collect_funding_rates(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StreamReport {
        let mut report = StreamReport::named("funding_rate".to_string());
        let step = chrono::Duration::hours(FUNDING_INTERVAL_HOURS);

        let (raw, pages, partial) = self
            .fetch_window(
                &report.stream.clone(),
                start,
                end,
                step,
                CANDLE_PAGE_SPACING,
                |cursor| self.source.fetch_funding_rate(symbol, Some(cursor), FUNDING_PAGE_LIMIT),
                |e| e.funding_time,
            )
            .await;
        report.pages = pages;
        report.partial = partial;

        let mut by_key = BTreeMap::new();
        for event in raw {
            if event.funding_time >= start && event.funding_time <= end {
                by_key.insert(event.funding_time, event);
            }
        }
        let batch: Vec<_> = by_key.into_values().collect();
        let validation = validator::check_funding_rates(&batch);
        self.finish_stream(
            report,
            "funding_rate",
            symbol,
            (start, end),
            &batch,
            validation,
            self.storage.save_funding_rates_batch(&batch),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn collect_liquidations(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StreamReport {
        let mut report = StreamReport::named("liquidation".to_string());

        // The exchange only serves recent forced orders; one fetch, clipped.
        let raw = match self.source.fetch_liquidations(symbol, LIQUIDATION_FETCH_LIMIT).await {
            Ok(raw) => {
                report.pages = 1;
                raw
            }
            Err(err) => {
                self.tracker.record_error(&err, &report.stream);
                report.partial = matches!(err, IngestError::CircuitOpen { .. });
                report.error = Some(err.to_string());
                return report;
            }
        };

        let mut by_key = BTreeMap::new();
        for order in raw {
            if order.time >= start && order.time <= end {
                by_key.insert(order.order_id.clone(), order);
            }
        }
        let batch: Vec<_> = by_key.into_values().collect();
        let validation = validator::check_liquidations(&batch);
        self.finish_stream(
            report,
            "liquidation",
            symbol,
            (start, end),
            &batch,
            validation,
            self.storage.save_liquidations_batch(&batch),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn collect_long_short_ratios(
        &self,
        symbol: &str,
        period: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StreamReport {
        let mut report = StreamReport::named(format!("long_short_ratio_{period}"));
        let step = match interval_duration(period) {
            Ok(step) => step,
            Err(err) => {
                report.error = Some(err.to_string());
                return report;
            }
        };

        let (raw, pages, partial) = self
            .fetch_window(
                &report.stream.clone(),
                start,
                end,
                step,
                OI_PAGE_SPACING,
                |cursor| {
                    self.source
                        .fetch_top_trader_ratio(symbol, period, Some(cursor), RATIO_PAGE_LIMIT)
                },
                |s| s.time,
            )
            .await;
        report.pages = pages;
        report.partial = partial;

        let mut by_key = BTreeMap::new();
        for sample in raw {
            if sample.time >= start && sample.time <= end {
                by_key.insert(sample.time, sample);
            }
        }
        let batch: Vec<_> = by_key.into_values().collect();
        let validation = validator::check_long_short_ratios(&batch);
        self.finish_stream(
            report,
            "long_short_ratio",
            symbol,
            (start, end),
            &batch,
            validation,
            self.storage.save_long_short_ratios_batch(&batch),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn collect_order_book(&self, symbol: &str) -> StreamReport {
        let mut report = StreamReport::named("order_book".to_string());
        let snapshot = match self
            .source
            .fetch_order_book(symbol, self.settings.order_book_depth)
            .await
        {
            Ok(snapshot) => {
                report.pages = 1;
                snapshot
            }
            Err(err) => {
                self.tracker.record_error(&err, &report.stream);
                report.partial = matches!(err, IngestError::CircuitOpen { .. });
                report.error = Some(err.to_string());
                return report;
            }
        };

        let validation = validator::check_order_book(&snapshot);
        if validation.is_fatal() {
            for finding in &validation.fatal {
                self.tracker
                    .record_error(&IngestError::Validation(finding.clone()), &report.stream);
            }
            report.error = Some(validation.fatal.join("; "));
            return report;
        }
        match self.storage.save_order_book_snapshot(&snapshot).await {
            Ok(rows) => report.rows_written = rows,
            Err(err) => {
                self.tracker.record_error(&err, &report.stream);
                report.error = Some(err.to_string());
            }
        }
        report
    }

    /// Launches every configured stream for `symbol` concurrently, bounded
    /// by `collection.concurrency_limit` (default: the stream count).
    #[instrument(skip(self))]
    pub async fn collect_all_concurrent(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CollectionSummary {
        enum Job {
            Candles(String),
            OpenInterest(String),
            Funding,
            Liquidations,
            Ratio(String),
            OrderBook,
        }

        let mut jobs = Vec::new();
        for timeframe in &self.settings.timeframes {
            jobs.push(Job::Candles(timeframe.clone()));
        }
        for period in &self.settings.oi_periods {
            jobs.push(Job::OpenInterest(period.clone()));
            jobs.push(Job::Ratio(period.clone()));
        }
        jobs.push(Job::Funding);
        jobs.push(Job::Liquidations);
        jobs.push(Job::OrderBook);

        let limit = self.settings.concurrency_limit.unwrap_or(jobs.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let tasks = jobs.into_iter().map(|job| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match job {
                    Job::Candles(tf) => self.collect_candles(symbol, &tf, start, end).await,
                    Job::OpenInterest(p) => self.collect_open_interest(symbol, &p, start, end).await,
                    Job::Funding => self.collect_funding_rates(symbol, start, end).await,
                    Job::Liquidations => self.collect_liquidations(symbol, start, end).await,
                    Job::Ratio(p) => self.collect_long_short_ratios(symbol, &p, start, end).await,
                    Job::OrderBook => self.collect_order_book(symbol).await,
                }
            }
        });

        let reports = futures::future::join_all(tasks).await;
        let summary = CollectionSummary {
            symbol: symbol.to_string(),
            reports,
        };
        info!(
            symbol,
            rows = summary.total_rows(),
            failed = summary.failed_streams(),
            complete = summary.is_complete(),
            "backfill finished"
        );
        summary
    }
}
