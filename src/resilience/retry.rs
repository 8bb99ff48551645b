//! Bounded exponential-backoff retry with jitter.
//!
//! Retryable kinds are absorbed up to the configured budget; everything else
//! propagates immediately. On exhaustion the last error is re-raised
//! unchanged. Rate-limit responses back off twice as long as the schedule.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{IngestError, Result};

/// Fractional jitter applied around the computed delay when enabled.
const JITTER_FRACTION: f64 = 0.25;
/// Extra backoff multiplier after an explicit rate-limit response.
const RATE_LIMIT_BACKOFF_FACTOR: u32 = 2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Policy used for storage writes: a single retry, short fuse.
    pub fn storage() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            base: 2.0,
            jitter: false,
        }
    }

    /// Delay before re-attempt `attempt` (0-indexed):
    /// `min(max_delay, initial_delay * base^attempt)`, then +/- jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.base.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            let spread = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
            capped * (1.0 + spread)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Runs `operation`, retrying retryable failures up to `max_retries`
    /// times. Non-retryable failures (validation, malformed, circuit_open,
    /// client errors) propagate without consuming budget.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let mut delay = self.delay_for(attempt);
                    if matches!(err, IngestError::RateLimited(_)) {
                        delay *= RATE_LIMIT_BACKOFF_FACTOR;
                    }
                    warn!(
                        kind = err.kind(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[test]
    fn test_delay_schedule_without_jitter() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            base: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        // Capped by max_delay from attempt 5 onward.
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(9), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            base: 2.0,
            jitter: true,
        };
        for attempt in 0..6 {
            let nominal = 0.1 * 2f64.powi(attempt as i32);
            for _ in 0..100 {
                let d = policy.delay_for(attempt).as_secs_f64();
                assert!(d >= nominal * (1.0 - JITTER_FRACTION) - 1e-9);
                assert!(d <= nominal * (1.0 + JITTER_FRACTION) + 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            base: 2.0,
            jitter: false,
        };
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let value = policy
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 4 {
                    Err(IngestError::Timeout("deadline".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 10 + 20 + 40 + 80 = 150 ms of scheduled waiting.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(150));
        assert!(waited < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_exhaustion_reraises_last_error() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            base: 2.0,
            jitter: false,
        };
        let calls = AtomicU32::new(0);

        let err = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::Network("refused".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), "network");
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let err = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::CircuitOpen { endpoint: "ohlcv".into() })
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), "circuit_open");
    }
}
