//! End-to-end backfill scenarios driving the historical collector with a
//! scripted exchange and the in-memory embedded store.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_data_collector::collector::HistoricalCollector;
use futures_data_collector::config::CollectionSettings;
use futures_data_collector::resilience::ErrorTracker;
use futures_data_collector::storage::StorageDriver;

const T0: i64 = 1_700_000_000_000;

fn settings() -> CollectionSettings {
    CollectionSettings {
        symbols: vec![SYMBOL.to_string()],
        timeframes: vec![TIMEFRAME.to_string()],
        oi_periods: vec![TIMEFRAME.to_string()],
        ..CollectionSettings::default()
    }
}

#[tokio::test]
async fn test_window_backfill_persists_every_unique_timestamp() {
    // 40 grid points but the stub serves at most 16 per page, forcing the
    // collector through several pagination rounds.
    let grid_points: i64 = 40;
    let end_ms = T0 + (grid_points - 1) * STEP_MS;
    let mut exchange = StubExchange::grid(T0, end_ms);
    exchange.step_ms = STEP_MS;
    let exchange = Arc::new(exchange);
    let storage = memory_driver().await;
    let tracker = Arc::new(ErrorTracker::new());

    let collector = HistoricalCollector::new(
        exchange.clone(),
        storage.clone(),
        tracker,
        settings(),
    );

    let report = collector
        .collect_candles(SYMBOL, TIMEFRAME, ts(T0), ts(end_ms))
        .await;
    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert!(!report.partial);

    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(stored.len(), grid_points as usize);
    assert!(stored.windows(2).all(|w| w[0].open_time < w[1].open_time));

    // A version row records the completed window.
    let versions = storage.get_data_versions("ohlcv", SYMBOL, 5).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].record_count, grid_points);
    assert!(!versions[0].checksum.is_empty());
}

#[tokio::test]
async fn test_rerunning_backfill_is_idempotent() {
    let end_ms = T0 + 9 * STEP_MS;
    let exchange = Arc::new(StubExchange::grid(T0, end_ms));
    let storage = memory_driver().await;
    let tracker = Arc::new(ErrorTracker::new());
    let collector =
        HistoricalCollector::new(exchange, storage.clone(), tracker, settings());

    let first = collector
        .collect_candles(SYMBOL, TIMEFRAME, ts(T0), ts(end_ms))
        .await;
    assert_eq!(first.rows_written, 10);

    let second = collector
        .collect_candles(SYMBOL, TIMEFRAME, ts(T0), ts(end_ms))
        .await;
    assert_eq!(second.rows_written, 0);

    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(stored.len(), 10);
}

#[tokio::test]
async fn test_transient_failures_resume_at_same_cursor() {
    let end_ms = T0 + 9 * STEP_MS;
    let exchange = StubExchange::grid(T0, end_ms);
    exchange.fail_first.store(2, Ordering::SeqCst);
    let exchange = Arc::new(exchange);
    let storage = memory_driver().await;
    let tracker = Arc::new(ErrorTracker::new());
    let collector =
        HistoricalCollector::new(exchange.clone(), storage.clone(), tracker.clone(), settings());

    let report = collector
        .collect_candles(SYMBOL, TIMEFRAME, ts(T0), ts(end_ms))
        .await;
    assert!(report.error.is_none());

    // The two injected failures were recorded and the window still filled.
    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(stored.len(), 10);
    assert_eq!(tracker.summary().by_kind.get("timeout"), Some(&2));
}

#[tokio::test]
async fn test_fatal_validation_rejects_batch_without_storage_write() {
    let end_ms = T0 + 4 * STEP_MS;
    let mut exchange = StubExchange::grid(T0, end_ms);
    exchange.corrupt_first_candle = true;
    let exchange = Arc::new(exchange);
    let storage = Arc::new(RecordingDriver::new(memory_driver().await));
    let tracker = Arc::new(ErrorTracker::new());
    let collector = HistoricalCollector::new(
        exchange,
        storage.clone(),
        tracker.clone(),
        settings(),
    );

    let report = collector
        .collect_candles(SYMBOL, TIMEFRAME, ts(T0), ts(end_ms))
        .await;
    assert!(report.error.is_some());

    // The driver was never called and a validation error was tracked.
    assert_eq!(storage.candle_batches.load(Ordering::SeqCst), 0);
    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert!(stored.is_empty());
    assert!(tracker.summary().by_kind.get("validation").copied().unwrap_or(0) >= 1);
}

#[tokio::test]
async fn test_collect_all_concurrent_aggregates_stream_reports() {
    let end_ms = T0 + 9 * STEP_MS;
    let exchange = Arc::new(StubExchange::grid(T0, end_ms));
    let storage = memory_driver().await;
    let tracker = Arc::new(ErrorTracker::new());
    let collector =
        HistoricalCollector::new(exchange, storage.clone(), tracker, settings());

    let summary = collector
        .collect_all_concurrent(SYMBOL, ts(T0), ts(end_ms))
        .await;

    // ohlcv, open interest, ratio, funding, liquidations, order book.
    assert_eq!(summary.reports.len(), 6);
    assert!(summary.is_complete(), "reports: {:?}", summary.reports);
    assert_eq!(summary.symbol, SYMBOL);

    // Candles and OI both filled their windows; the book snapshot landed.
    let candles = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(candles.len(), 10);
    let oi = storage.get_open_interest(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(oi.len(), 10);
    assert!(storage.get_latest_order_book(SYMBOL).await.unwrap().is_some());
    let liquidations = storage.get_liquidations(SYMBOL, None, None).await.unwrap();
    assert_eq!(liquidations.len(), 2);
}

#[tokio::test]
async fn test_cancellation_stops_within_current_iteration() {
    let end_ms = T0 + 1000 * STEP_MS;
    let exchange = Arc::new(StubExchange::grid(T0, end_ms));
    let storage = memory_driver().await;
    let tracker = Arc::new(ErrorTracker::new());
    let collector =
        HistoricalCollector::new(exchange, storage, tracker, settings());

    // Cancel before starting: the stream must come back partial with no pages.
    let cancel = collector.cancel_handle();
    cancel.store(true, Ordering::SeqCst);
    let report = collector
        .collect_candles(SYMBOL, TIMEFRAME, ts(T0), ts(end_ms))
        .await;
    assert!(report.partial);
    assert_eq!(report.pages, 0);
}
