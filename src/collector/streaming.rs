//! Real-time ingestion: batches WebSocket events and flushes them to storage.
//!
//! Events accumulate in per-kind buffers and flush when a buffer reaches the
//! configured batch size or the flush interval elapses, whichever comes
//! first. Each flush is one storage batch (atomic per the driver contract)
//! followed by a cache refresh of the latest value per `kind:symbol` key.
//! Stopping drains the in-flight buffers before returning, so a batch is
//! either fully persisted or fully absent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::cache::{cache_key, RedisCache};
use crate::models::{Candle, FundingRate, Liquidation, MarkPrice, StreamEvent};
use crate::resilience::ErrorTracker;
use crate::storage::StorageDriver;

/// Cache TTL for latest-value entries.
const CACHE_TTL_SECS: u64 = 300;

#[derive(Default)]
struct EventBuffers {
    candles: Vec<Candle>,
    mark_prices: Vec<MarkPrice>,
    liquidations: Vec<Liquidation>,
}

impl EventBuffers {
    fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Candle(c) => self.candles.push(c),
            StreamEvent::MarkPrice(m) => self.mark_prices.push(m),
            StreamEvent::Liquidation(l) => self.liquidations.push(l),
        }
    }

    fn any_full(&self, batch_size: usize) -> bool {
        self.candles.len() >= batch_size
            || self.mark_prices.len() >= batch_size
            || self.liquidations.len() >= batch_size
    }

    fn is_empty(&self) -> bool {
        self.candles.is_empty() && self.mark_prices.is_empty() && self.liquidations.is_empty()
    }
}

/// Handle over a spawned streaming consumer.
pub struct StreamingHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StreamingHandle {
    /// Signals the consumer and waits until the final drain completes.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

pub struct StreamingCollector {
    storage: Arc<dyn StorageDriver>,
    cache: Option<Arc<RedisCache>>,
    tracker: Arc<ErrorTracker>,
    batch_size: usize,
    flush_interval: Duration,
}

impl StreamingCollector {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        cache: Option<Arc<RedisCache>>,
        tracker: Arc<ErrorTracker>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            storage,
            cache,
            tracker,
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }

    /// Spawns the consumer over `events`; the returned handle stops it.
    pub fn spawn(self: Arc<Self>, events: mpsc::Receiver<StreamEvent>) -> StreamingHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            self.run(events, stop_rx).await;
        });
        StreamingHandle { stop_tx, task }
    }

    /// Consumer loop. Returns after a stop signal or producer shutdown, once
    /// remaining buffers are drained.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<StreamEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut buffers = EventBuffers::default();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(batch_size = self.batch_size, interval_ms = self.flush_interval.as_millis() as u64, "streaming consumer started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        debug!(kind = event.kind(), symbol = event.symbol(), "stream event");
                        buffers.push(event);
                        if buffers.any_full(self.batch_size) {
                            self.flush(&mut buffers).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush(&mut buffers).await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        // Final drain: the in-flight batch is persisted before we return.
        self.flush(&mut buffers).await;
        info!("streaming consumer stopped");
    }

    async fn flush(&self, buffers: &mut EventBuffers) {
        if buffers.is_empty() {
            return;
        }

        if !buffers.candles.is_empty() {
            let batch = std::mem::take(&mut buffers.candles);
            match self.storage.save_candles_batch(&batch).await {
                Ok(rows) => {
                    debug!(rows, total = batch.len(), "flushed candle batch");
                    self.update_cache_latest("kline", batch.iter().map(|c| (c.symbol.clone(), c)))
                        .await;
                }
                Err(err) => self.tracker.record_error(&err, "streaming_flush_candles"),
            }
        }

        if !buffers.mark_prices.is_empty() {
            let batch = std::mem::take(&mut buffers.mark_prices);
            // Mark-price events carry the in-window funding rate; persist it
            // first-writer-wins so the settled funding log is never rewritten.
            let funding: Vec<FundingRate> = batch
                .iter()
                .filter_map(|m| {
                    Some(FundingRate {
                        symbol: m.symbol.clone(),
                        funding_time: m.next_funding_time?,
                        funding_rate: m.funding_rate?,
                        mark_price: Some(m.mark_price),
                    })
                })
                .collect();
            if !funding.is_empty() {
                if let Err(err) = self.storage.save_funding_rates_batch(&funding).await {
                    self.tracker.record_error(&err, "streaming_flush_funding");
                }
            }
            self.update_cache_latest("mark_price", batch.iter().map(|m| (m.symbol.clone(), m)))
                .await;
        }

        if !buffers.liquidations.is_empty() {
            let batch = std::mem::take(&mut buffers.liquidations);
            match self.storage.save_liquidations_batch(&batch).await {
                Ok(rows) => {
                    debug!(rows, total = batch.len(), "flushed liquidation batch");
                    self.update_cache_latest(
                        "liquidation",
                        batch.iter().map(|l| (l.symbol.clone(), l)),
                    )
                    .await;
                }
                Err(err) => self.tracker.record_error(&err, "streaming_flush_liquidations"),
            }
        }
    }

    /// Writes the most recent record per symbol under `kind:symbol`.
    async fn update_cache_latest<'a, T: serde::Serialize + 'a>(
        &self,
        kind: &str,
        records: impl Iterator<Item = (String, &'a T)>,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut latest: HashMap<String, &T> = HashMap::new();
        for (symbol, record) in records {
            latest.insert(symbol, record);
        }
        let mut entries = Vec::with_capacity(latest.len());
        for (symbol, record) in latest {
            match serde_json::to_vec(record) {
                Ok(bytes) => entries.push((cache_key(kind, &symbol), bytes)),
                Err(err) => warn!(error = %err, "cache serialization failed"),
            }
        }
        if let Err(err) = cache.set_multi(&entries, CACHE_TTL_SECS).await {
            // Cache is best-effort; never fail a flush over it.
            warn!(error = %err, "cache update failed");
        }
    }
}
