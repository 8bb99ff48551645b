//! Health and error-monitor reporting.
//!
//! The health check probes storage, cache, and exchange reachability and
//! verifies data freshness (most recent candle no older than ten minutes).
//! The error monitor snapshots the tracker and every breaker.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;

use crate::cache::RedisCache;
use crate::exchange::MarketDataSource;
use crate::resilience::{BreakerStats, BreakerRegistry, ErrorSummary, ErrorTracker};
use crate::storage::StorageDriver;
use crate::utils::time::current_timestamp;

/// Candles older than this make the freshness probe unhealthy.
const FRESHNESS_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub detail: String,
}

impl ComponentHealth {
    fn ok(detail: impl Into<String>) -> Self {
        Self { healthy: true, detail: detail.into() }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self { healthy: false, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub database: ComponentHealth,
    pub cache: ComponentHealth,
    pub exchange: ComponentHealth,
    pub data_freshness: ComponentHealth,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database.healthy && self.exchange.healthy
    }
}

pub struct HealthCheck {
    storage: Arc<dyn StorageDriver>,
    cache: Option<Arc<RedisCache>>,
    source: Arc<dyn MarketDataSource>,
    probe_symbol: String,
    probe_timeframe: String,
}

impl HealthCheck {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        cache: Option<Arc<RedisCache>>,
        source: Arc<dyn MarketDataSource>,
        probe_symbol: String,
        probe_timeframe: String,
    ) -> Self {
        Self {
            storage,
            cache,
            source,
            probe_symbol,
            probe_timeframe,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let database = match self.storage.info().await {
            Ok(info) => ComponentHealth::ok(format!(
                "{} (initialized: {}, size: {})",
                info.backend.as_str(),
                info.initialized,
                info.size_bytes.map_or("unknown".to_string(), |b| b.to_string()),
            )),
            Err(err) => ComponentHealth::failed(err.to_string()),
        };

        let cache = match &self.cache {
            None => ComponentHealth::ok("not configured"),
            Some(cache) => match cache.ping().await {
                Ok(()) => ComponentHealth::ok("reachable"),
                Err(err) => ComponentHealth::failed(err.to_string()),
            },
        };

        let exchange = match self.source.server_time().await {
            Ok(server_time) => ComponentHealth::ok(format!("server time {server_time}")),
            Err(err) => ComponentHealth::failed(err.to_string()),
        };

        let data_freshness = match self
            .storage
            .get_latest_candles(&self.probe_symbol, &self.probe_timeframe, 1)
            .await
        {
            Ok(latest) => match latest.first() {
                Some(candle) => {
                    let age = current_timestamp() - candle.open_time;
                    if age <= Duration::minutes(FRESHNESS_WINDOW_MINUTES) {
                        ComponentHealth::ok(format!("latest candle {}", candle.open_time))
                    } else {
                        ComponentHealth::failed(format!(
                            "latest candle {} is {} minutes old",
                            candle.open_time,
                            age.num_minutes()
                        ))
                    }
                }
                None => ComponentHealth::failed(format!(
                    "no candles stored for {}",
                    self.probe_symbol
                )),
            },
            Err(err) => ComponentHealth::failed(err.to_string()),
        };

        HealthReport {
            database,
            cache,
            exchange,
            data_freshness,
            generated_at: current_timestamp(),
        }
    }
}

/// Snapshot rendered by `monitor-errors`.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub errors: ErrorSummary,
    pub breakers: Vec<BreakerStats>,
}

pub fn monitor_report(tracker: &ErrorTracker, breakers: &BreakerRegistry) -> MonitorReport {
    MonitorReport {
        errors: tracker.summary(),
        breakers: breakers.stats(),
    }
}
