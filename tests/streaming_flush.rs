//! Streaming collector batching and shutdown semantics, driven through an
//! injected event channel and the in-memory embedded store.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use futures_data_collector::collector::StreamingCollector;
use futures_data_collector::models::StreamEvent;
use futures_data_collector::resilience::ErrorTracker;
use futures_data_collector::storage::StorageDriver;

const T0: i64 = 1_700_000_000_000;
const BATCH_SIZE: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

fn collector(storage: Arc<RecordingDriver>) -> Arc<StreamingCollector> {
    Arc::new(StreamingCollector::new(
        storage,
        None,
        Arc::new(ErrorTracker::new()),
        BATCH_SIZE,
        FLUSH_INTERVAL,
    ))
}

#[tokio::test]
async fn test_interval_flushes_partial_batch() {
    let storage = Arc::new(RecordingDriver::new(memory_driver().await));
    let (tx, rx) = mpsc::channel(64);
    let handle = collector(storage.clone()).spawn(rx);

    // Nine events: below the size threshold, so only the interval flushes.
    for i in 0..9 {
        tx.send(StreamEvent::Candle(candle(T0 + i * STEP_MS))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(storage.candle_batches.load(Ordering::SeqCst), 1);
    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(stored.len(), 9);

    drop(tx);
    handle.stop().await;
}

#[tokio::test]
async fn test_batch_size_triggers_immediate_flush() {
    let storage = Arc::new(RecordingDriver::new(memory_driver().await));
    let (tx, rx) = mpsc::channel(64);
    let handle = collector(storage.clone()).spawn(rx);

    for i in 0..BATCH_SIZE as i64 {
        tx.send(StreamEvent::Candle(candle(T0 + i * STEP_MS))).await.unwrap();
    }
    // Well under the flush interval: the size threshold must have fired.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(stored.len(), BATCH_SIZE);

    drop(tx);
    handle.stop().await;
}

#[tokio::test]
async fn test_stop_drains_in_flight_batch() {
    let storage = Arc::new(RecordingDriver::new(memory_driver().await));
    let (tx, rx) = mpsc::channel(64);
    let handle = collector(storage.clone()).spawn(rx);

    for i in 0..5 {
        tx.send(StreamEvent::Candle(candle(T0 + i * STEP_MS))).await.unwrap();
    }
    // Give the consumer a moment to pull the events off the channel, then
    // stop before the interval would flush them.
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop().await;

    // The in-flight batch was persisted in full; nothing was lost.
    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(stored.len(), 5);

    // No further writes happen after stop resolves.
    let batches_after_stop = storage.candle_batches.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(storage.candle_batches.load(Ordering::SeqCst), batches_after_stop);
}

#[tokio::test]
async fn test_liquidation_events_batch_separately() {
    let storage = Arc::new(RecordingDriver::new(memory_driver().await));
    let (tx, rx) = mpsc::channel(64);
    let handle = collector(storage.clone()).spawn(rx);

    tx.send(StreamEvent::Candle(candle(T0))).await.unwrap();
    tx.send(StreamEvent::Liquidation(liquidation("5001", T0))).await.unwrap();
    tx.send(StreamEvent::Liquidation(liquidation("5002", T0 + 1))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let candles = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(candles.len(), 1);
    let liquidations = storage.get_liquidations(SYMBOL, None, None).await.unwrap();
    assert_eq!(liquidations.len(), 2);
    assert!(storage.liquidation_batches.load(Ordering::SeqCst) >= 1);

    drop(tx);
    handle.stop().await;
}

#[tokio::test]
async fn test_duplicate_stream_candles_do_not_duplicate_rows() {
    let storage = Arc::new(RecordingDriver::new(memory_driver().await));
    let (tx, rx) = mpsc::channel(64);
    let handle = collector(storage.clone()).spawn(rx);

    // The same open candle delivered three times (in-progress rewrites),
    // then its closed form.
    let mut open_candle = candle(T0);
    open_candle.is_closed = false;
    for _ in 0..3 {
        tx.send(StreamEvent::Candle(open_candle.clone())).await.unwrap();
    }
    let mut closed = candle(T0);
    closed.close = dec("10.9");
    tx.send(StreamEvent::Candle(closed)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stored = storage.get_candles(SYMBOL, TIMEFRAME, None, None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].close, dec("10.9"));
    assert!(stored[0].is_closed);

    drop(tx);
    handle.stop().await;
}
