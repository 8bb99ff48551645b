//! Time utilities for standardized timestamp handling across the pipeline.
//!
//! The exchange speaks epoch milliseconds; storage backends and the models
//! speak `DateTime<Utc>`. Conversions live here, together with the
//! timeframe/period arithmetic the collectors use to advance their cursors.

use chrono::{DateTime, Duration, TimeZone, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimeError {
    #[error("timestamp out of range: {0}")]
    OutOfRange(i64),
    #[error("unknown interval: {0}")]
    UnknownInterval(String),
}

/// Current UTC timestamp.
#[inline]
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Converts epoch milliseconds to a UTC instant.
pub fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>, TimeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(TimeError::OutOfRange(ms))
}

/// Converts a UTC instant to epoch milliseconds.
#[inline]
pub fn datetime_to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Parses an exchange interval string ("1m", "5m", "1h", "4h", "1d", ...)
/// into a duration. Used for cursor advancement and continuity checks.
pub fn interval_duration(interval: &str) -> Result<Duration, TimeError> {
    let (value, unit) = interval.split_at(interval.len().saturating_sub(1));
    let n: i64 = value
        .parse()
        .map_err(|_| TimeError::UnknownInterval(interval.to_string()))?;
    if n <= 0 {
        return Err(TimeError::UnknownInterval(interval.to_string()));
    }
    match unit {
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        "w" => Ok(Duration::weeks(n)),
        _ => Err(TimeError::UnknownInterval(interval.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_round_trip() {
        let ms = 1_700_000_000_000;
        let ts = ms_to_datetime(ms).unwrap();
        assert_eq!(datetime_to_ms(ts), ms);
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(interval_duration("1m").unwrap(), Duration::minutes(1));
        assert_eq!(interval_duration("5m").unwrap(), Duration::minutes(5));
        assert_eq!(interval_duration("4h").unwrap(), Duration::hours(4));
        assert_eq!(interval_duration("1d").unwrap(), Duration::days(1));
        assert!(interval_duration("fast").is_err());
        assert!(interval_duration("0m").is_err());
        assert!(interval_duration("").is_err());
    }
}
