//! Application configuration: canonical keys, file + environment loading,
//! and startup validation.
//!
//! Configuration errors are fatal at startup and map to exit code 1. A JSON
//! file supplies the bulk of the settings; credentials and endpoints may be
//! overridden from the environment (a `.env` file is honored).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::utils::time::interval_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    Relational,
    EmbeddedFile,
    CloudDoc,
}

/// Relational backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "market_data".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

impl DatabaseSettings {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedSettings {
    pub path: String,
}

impl Default for EmbeddedSettings {
    fn default() -> Self {
        Self {
            path: "data/market_data.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub credentials_path: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub pool_size: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            pool_size: 50,
        }
    }
}

impl CacheSettings {
    pub fn connection_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    pub symbols: Vec<String>,
    pub timeframes: Vec<String>,
    pub oi_periods: Vec<String>,
    pub historical_days: u32,
    pub batch_size: usize,
    pub ws_batch_size: usize,
    pub ws_batch_interval_ms: u64,
    pub order_book_depth: u32,
    pub concurrency_limit: Option<usize>,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["SOL/USDT".to_string()],
            timeframes: vec!["5m".to_string(), "1h".to_string()],
            oi_periods: vec!["5m".to_string(), "1h".to_string()],
            historical_days: 30,
            batch_size: 1000,
            ws_batch_size: 10,
            ws_batch_interval_ms: 100,
            order_book_depth: 100,
            concurrency_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub ws_url: String,
    pub api_key: Option<String>,
    pub requests_per_minute: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com".to_string(),
            api_key: None,
            requests_per_minute: 1200,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_type: DatabaseType,
    pub database: DatabaseSettings,
    pub embedded: EmbeddedSettings,
    pub cloud: CloudSettings,
    pub cache: Option<CacheSettings>,
    pub collection: CollectionSettings,
    pub resilience: ResilienceSettings,
    pub exchange: ExchangeSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::EmbeddedFile,
            database: DatabaseSettings::default(),
            embedded: EmbeddedSettings::default(),
            cloud: CloudSettings::default(),
            cache: None,
            collection: CollectionSettings::default(),
            resilience: ResilienceSettings::default(),
            exchange: ExchangeSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from an optional JSON file, applies environment
    /// overrides, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    IngestError::Config(format!("read {}: {e}", path.display()))
                })?;
                serde_json::from_str(&raw)
                    .map_err(|e| IngestError::Config(format!("parse {}: {e}", path.display())))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        info!(database_type = ?config.database_type, symbols = ?config.collection.symbols, "configuration loaded");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        if let Some(v) = get("DATABASE_TYPE") {
            match v.as_str() {
                "relational" => self.database_type = DatabaseType::Relational,
                "embedded_file" => self.database_type = DatabaseType::EmbeddedFile,
                "cloud_doc" => self.database_type = DatabaseType::CloudDoc,
                _ => {}
            }
        }
        if let Some(v) = get("DATABASE_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("DATABASE_PORT").and_then(|v| v.parse().ok()) {
            self.database.port = v;
        }
        if let Some(v) = get("DATABASE_NAME") {
            self.database.database = v;
        }
        if let Some(v) = get("DATABASE_USER") {
            self.database.user = v;
        }
        if let Some(v) = get("DATABASE_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = get("EMBEDDED_PATH") {
            self.embedded.path = v;
        }
        if let Some(v) = get("CLOUD_URL") {
            self.cloud.url = v;
        }
        if let Some(v) = get("CLOUD_CREDENTIALS_PATH") {
            self.cloud.credentials_path = Some(v);
        }
        if let Some(v) = get("CACHE_HOST") {
            self.cache.get_or_insert_with(CacheSettings::default).host = v;
        }
        if let Some(v) = get("CACHE_PORT").and_then(|v| v.parse().ok()) {
            self.cache.get_or_insert_with(CacheSettings::default).port = v;
        }
        if let Some(v) = get("EXCHANGE_BASE_URL") {
            self.exchange.base_url = v;
        }
        if let Some(v) = get("EXCHANGE_WS_URL") {
            self.exchange.ws_url = v;
        }
        if let Some(v) = get("EXCHANGE_API_KEY") {
            self.exchange.api_key = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.database_type {
            DatabaseType::Relational => {
                if self.database.host.is_empty()
                    || self.database.database.is_empty()
                    || self.database.user.is_empty()
                {
                    return Err(IngestError::Config(
                        "relational backend requires database.{host,database,user}".to_string(),
                    ));
                }
            }
            DatabaseType::EmbeddedFile => {
                if self.embedded.path.is_empty() {
                    return Err(IngestError::Config("embedded.path must be set".to_string()));
                }
            }
            DatabaseType::CloudDoc => {
                if self.cloud.url.is_empty() {
                    return Err(IngestError::Config("cloud.url must be set".to_string()));
                }
            }
        }

        if self.collection.symbols.is_empty() {
            return Err(IngestError::Config("collection.symbols must not be empty".to_string()));
        }
        for symbol in &self.collection.symbols {
            if !symbol.contains('/') {
                return Err(IngestError::Config(format!(
                    "symbol {symbol} must use the BASE/QUOTE form"
                )));
            }
        }
        for timeframe in self.collection.timeframes.iter().chain(&self.collection.oi_periods) {
            interval_duration(timeframe)
                .map_err(|e| IngestError::Config(format!("bad interval: {e}")))?;
        }
        if self.collection.ws_batch_size == 0 || self.collection.batch_size == 0 {
            return Err(IngestError::Config("batch sizes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.resilience.retry.max_retries,
            initial_delay: Duration::from_millis(self.resilience.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.resilience.retry.max_delay_ms),
            base: 2.0,
            jitter: true,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.resilience.breaker.failure_threshold,
            recovery_timeout: Duration::from_secs(self.resilience.breaker.recovery_timeout_secs),
            success_threshold: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database_type, DatabaseType::EmbeddedFile);
        assert_eq!(config.collection.ws_batch_size, 10);
    }

    #[test]
    fn test_symbol_form_is_enforced() {
        let mut config = AppConfig::default();
        config.collection.symbols = vec!["SOLUSDT".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_interval_rejected() {
        let mut config = AppConfig::default();
        config.collection.timeframes = vec!["fast".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cloud_requires_url() {
        let mut config = AppConfig::default();
        config.database_type = DatabaseType::CloudDoc;
        assert!(config.validate().is_err());
        config.cloud.url = "https://project.firebaseio.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_urls() {
        let config = AppConfig::default();
        assert!(config.database.connection_url().starts_with("postgres://"));
        assert_eq!(
            CacheSettings::default().connection_url(),
            "redis://localhost:6379/0"
        );
    }

    #[test]
    fn test_file_round_trip() {
        let config = AppConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.collection.symbols, config.collection.symbols);
    }
}
