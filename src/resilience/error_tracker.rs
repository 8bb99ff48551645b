//! Process-wide error tracking with bounded history and alert cooldowns.
//!
//! A single tracker instance is created at startup and injected into every
//! component. All mutations take one mutex and complete without I/O; the
//! alert sink is invoked after the lock is released so a slow sink can never
//! stall the hot path.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::error::{IngestError, Result};
use crate::utils::time::current_timestamp;

/// Ring capacity for retained error records.
const HISTORY_CAPACITY: usize = 1000;
/// Sliding window for rate computation and alert counts, in seconds.
const RATE_WINDOW_SECS: i64 = 300;
/// A kind alerts when its windowed count exceeds this.
const ALERT_COUNT_THRESHOLD: usize = 10;
/// ... or when its per-minute rate exceeds this.
const ALERT_RATE_PER_MIN: f64 = 5.0;
/// Minimum spacing between alerts for the same kind, in seconds.
const ALERT_COOLDOWN_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// One retained error occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub context: String,
    pub severity: Severity,
}

/// Consistent snapshot returned by [`ErrorTracker::summary`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total: u64,
    pub by_kind: HashMap<String, u64>,
    pub rates_per_min: HashMap<String, f64>,
    pub recent: Vec<ErrorRecord>,
    pub generated_at: DateTime<Utc>,
}

/// Alert delivery. Implementations must not block; the default sink logs.
pub trait AlertSink: Send + Sync {
    fn alert(&self, kind: &str, windowed_count: usize, rate_per_min: f64);
}

/// Default sink: a structured warning in the log stream.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, kind: &str, windowed_count: usize, rate_per_min: f64) {
        warn!(
            kind,
            windowed_count,
            rate_per_min,
            "error rate alert"
        );
    }
}

struct TrackerInner {
    total: u64,
    by_kind: HashMap<String, u64>,
    history: VecDeque<ErrorRecord>,
    // Per-kind timestamps within the sliding window, pruned on every record.
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

impl TrackerInner {
    fn new() -> Self {
        Self {
            total: 0,
            by_kind: HashMap::new(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            windows: HashMap::new(),
            cooldowns: HashMap::new(),
        }
    }
}

/// Centralized error tracker shared across the pipeline.
pub struct ErrorTracker {
    inner: Mutex<TrackerInner>,
    sink: Arc<dyn AlertSink>,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(LogAlertSink))
    }

    pub fn with_sink(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::new()),
            sink,
        }
    }

    /// Records one error occurrence and evaluates the alert policy.
    pub fn record(&self, kind: &str, message: &str, context: &str, severity: Severity) {
        let now = current_timestamp();
        let fired = {
            let mut inner = self.inner.lock();
            inner.total += 1;
            *inner.by_kind.entry(kind.to_string()).or_insert(0) += 1;

            if inner.history.len() == HISTORY_CAPACITY {
                inner.history.pop_front();
            }
            inner.history.push_back(ErrorRecord {
                timestamp: now,
                kind: kind.to_string(),
                message: message.to_string(),
                context: context.to_string(),
                severity,
            });

            let window = inner.windows.entry(kind.to_string()).or_default();
            window.push_back(now);
            let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
            while window.front().is_some_and(|ts| *ts < cutoff) {
                window.pop_front();
            }
            let count = window.len();
            let rate = count as f64 / (RATE_WINDOW_SECS as f64 / 60.0);

            let should_alert = count > ALERT_COUNT_THRESHOLD || rate > ALERT_RATE_PER_MIN;
            let cooled_down = inner
                .cooldowns
                .get(kind)
                .map_or(true, |last| now - *last >= Duration::seconds(ALERT_COOLDOWN_SECS));

            if should_alert && cooled_down {
                inner.cooldowns.insert(kind.to_string(), now);
                Some((count, rate))
            } else {
                None
            }
        };

        // Sink runs without the lock held.
        if let Some((count, rate)) = fired {
            self.sink.alert(kind, count, rate);
        }
    }

    /// Convenience wrapper deriving kind and severity from the error itself.
    pub fn record_error(&self, err: &IngestError, context: &str) {
        let severity = match err {
            IngestError::Config(_) => Severity::Critical,
            IngestError::Validation(_) | IngestError::Malformed(_) => Severity::Warning,
            _ => Severity::Error,
        };
        self.record(err.kind(), &err.to_string(), context, severity);
    }

    /// Returns a consistent snapshot of totals, per-kind rates over the last
    /// five minutes, and the retained history.
    pub fn summary(&self) -> ErrorSummary {
        let now = current_timestamp();
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        let inner = self.inner.lock();

        let rates_per_min = inner
            .windows
            .iter()
            .map(|(kind, window)| {
                let count = window.iter().filter(|ts| **ts >= cutoff).count();
                (kind.clone(), count as f64 / (RATE_WINDOW_SECS as f64 / 60.0))
            })
            .collect();

        ErrorSummary {
            total: inner.total,
            by_kind: inner.by_kind.clone(),
            rates_per_min,
            recent: inner.history.iter().cloned().collect(),
            generated_at: now,
        }
    }

    /// Serializes a snapshot to `path` as pretty JSON.
    pub fn export(&self, path: &Path) -> Result<()> {
        let snapshot = self.summary();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, bytes)
            .map_err(|e| IngestError::Storage(format!("export to {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = TrackerInner::new();
    }
}
