//! Shared utilities for the futures data collector.
//!
//! Currently limited to time handling: every record in the pipeline carries a
//! UTC instant with millisecond precision, and both the exchange wire formats
//! and the storage backends speak epoch milliseconds.

pub mod time;

pub use time::{
    current_timestamp, datetime_to_ms, interval_duration, ms_to_datetime, TimeError,
};
