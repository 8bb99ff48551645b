//! Collectors: historical backfill and real-time streaming ingestion.

pub mod historical;
pub mod streaming;

pub use historical::HistoricalCollector;
pub use streaming::StreamingCollector;

/// Outcome of one (symbol, resource) stream within a backfill run.
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub stream: String,
    pub rows_written: u64,
    pub pages: u32,
    /// True when the stream stopped early (open circuit, cancellation, or a
    /// non-retryable failure) and the window may be incomplete.
    pub partial: bool,
    pub error: Option<String>,
}

impl StreamReport {
    pub fn named(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            rows_written: 0,
            pages: 0,
            partial: false,
            error: None,
        }
    }
}

/// Aggregate of all stream reports for one symbol.
#[derive(Debug, Clone)]
pub struct CollectionSummary {
    pub symbol: String,
    pub reports: Vec<StreamReport>,
}

impl CollectionSummary {
    pub fn total_rows(&self) -> u64 {
        self.reports.iter().map(|r| r.rows_written).sum()
    }

    pub fn failed_streams(&self) -> usize {
        self.reports.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.reports.iter().all(|r| !r.partial && r.error.is_none())
    }
}
