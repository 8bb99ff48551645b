//! Process-wide error taxonomy for the ingestion pipeline.
//!
//! Every failure that crosses a component boundary is an [`IngestError`].
//! The `kind()` strings are stable identifiers consumed by the error tracker
//! and the retry classifier; changing one is a breaking change for alerting.

use thiserror::Error;

/// Unified error type for exchange, storage, and pipeline failures.
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("exchange server error ({status}): {message}")]
    ExchangeServer { status: u16, message: String },

    #[error("exchange client error ({status}): {message}")]
    ExchangeClient { status: u16, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("circuit open for endpoint {endpoint}")]
    CircuitOpen { endpoint: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    /// Stable kind string used by the error tracker and alert policy.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Network(_) => "network",
            IngestError::Timeout(_) => "timeout",
            IngestError::RateLimited(_) => "rate_limit",
            IngestError::ExchangeServer { .. } => "exchange_server",
            IngestError::ExchangeClient { .. } => "exchange_client",
            IngestError::Validation(_) => "validation",
            IngestError::CircuitOpen { .. } => "circuit_open",
            IngestError::Storage(_) => "storage",
            IngestError::Config(_) => "config",
            IngestError::Malformed(_) => "malformed",
            IngestError::Cancelled => "cancelled",
        }
    }

    /// Whether the retry policy may re-attempt after this failure.
    ///
    /// Storage failures are retryable exactly once; the storage call sites
    /// enforce that budget with a dedicated single-retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Network(_)
                | IngestError::Timeout(_)
                | IngestError::RateLimited(_)
                | IngestError::ExchangeServer { .. }
                | IngestError::Storage(_)
        )
    }

    /// Maps the failure to the process exit code contract:
    /// 1 configuration, 2 storage, 3 exchange unreachable, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            IngestError::Config(_) => 1,
            IngestError::Storage(_) => 2,
            IngestError::Cancelled => 4,
            IngestError::Validation(_) | IngestError::Malformed(_) => 2,
            _ => 3,
        }
    }

    /// Maps an HTTP status code from the exchange to the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => IngestError::RateLimited(message),
            s if s >= 500 => IngestError::ExchangeServer { status: s, message },
            s => IngestError::ExchangeClient { status: s, message },
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IngestError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            IngestError::Network(err.to_string())
        } else if err.is_decode() {
            IngestError::Malformed(err.to_string())
        } else {
            IngestError::Network(err.to_string())
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for IngestError {
    fn from(err: redis::RedisError) -> Self {
        IngestError::Storage(format!("cache: {err}"))
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(IngestError::Network("x".into()).kind(), "network");
        assert_eq!(IngestError::Timeout("x".into()).kind(), "timeout");
        assert_eq!(IngestError::RateLimited("x".into()).kind(), "rate_limit");
        assert_eq!(
            IngestError::ExchangeServer { status: 503, message: "x".into() }.kind(),
            "exchange_server"
        );
        assert_eq!(
            IngestError::CircuitOpen { endpoint: "ohlcv".into() }.kind(),
            "circuit_open"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(IngestError::Network("refused".into()).is_retryable());
        assert!(IngestError::Timeout("deadline".into()).is_retryable());
        assert!(IngestError::RateLimited("429".into()).is_retryable());
        assert!(IngestError::ExchangeServer { status: 502, message: String::new() }.is_retryable());

        assert!(!IngestError::Validation("bad ohlc".into()).is_retryable());
        assert!(!IngestError::Malformed("truncated".into()).is_retryable());
        assert!(!IngestError::CircuitOpen { endpoint: "oi".into() }.is_retryable());
        assert!(!IngestError::ExchangeClient { status: 404, message: String::new() }.is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(IngestError::from_status(429, "slow down").kind(), "rate_limit");
        assert_eq!(IngestError::from_status(500, "boom").kind(), "exchange_server");
        assert_eq!(IngestError::from_status(418, "teapot").kind(), "exchange_client");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(IngestError::Config("missing host".into()).exit_code(), 1);
        assert_eq!(IngestError::Storage("down".into()).exit_code(), 2);
        assert_eq!(IngestError::Network("refused".into()).exit_code(), 3);
        assert_eq!(IngestError::Cancelled.exit_code(), 4);
    }
}
