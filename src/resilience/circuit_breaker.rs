//! Per-endpoint circuit breakers with a named registry.
//!
//! Each breaker guards one external endpoint. The admission decision and the
//! state transition happen inside a single critical section, so a rejected
//! call can never race a concurrent transition, and a rejected call never
//! invokes the wrapped function.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning. Endpoint breakers created by the registry default to the
/// wider 10/120 s profile; the 5/60 s profile is the generic default.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    /// Profile used for exchange endpoint breakers.
    pub fn endpoint() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(120),
            success_threshold: 2,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejections: u64,
    pub success_rate: f64,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            rejections: 0,
        }
    }
}

enum Outcome {
    Success,
    Failure,
    // Error that does not count as a breaker failure (e.g. a 4xx).
    Ignored,
}

type FailurePredicate = Arc<dyn Fn(&IngestError) -> bool + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    counts_as_failure: FailurePredicate,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_predicate(name, config, Arc::new(IngestError::is_retryable))
    }

    /// `counts_as_failure` decides which errors trip the breaker; everything
    /// else propagates without touching the failure counter.
    pub fn with_predicate(
        name: impl Into<String>,
        config: BreakerConfig,
        counts_as_failure: FailurePredicate,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            counts_as_failure,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wraps an async operation. A rejected call returns `CircuitOpen`
    /// without constructing or polling the wrapped future.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                self.settle(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                if (self.counts_as_failure)(&err) {
                    self.settle(Outcome::Failure);
                } else {
                    self.settle(Outcome::Ignored);
                }
                Err(err)
            }
        }
    }

    /// Synchronous equivalent of [`call`](Self::call).
    pub fn call_sync<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.try_acquire()?;
        match operation() {
            Ok(value) => {
                self.settle(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                if (self.counts_as_failure)(&err) {
                    self.settle(Outcome::Failure);
                } else {
                    self.settle(Outcome::Ignored);
                }
                Err(err)
            }
        }
    }

    /// Admission decision. Transitions OPEN -> HALF_OPEN when the recovery
    /// timeout has elapsed, admitting a single trial call at a time.
    fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.total_calls += 1;
                Ok(())
            }
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    info!(breaker = %self.name, "recovery timeout elapsed, trying half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    inner.total_calls += 1;
                    Ok(())
                } else {
                    inner.rejections += 1;
                    Err(IngestError::CircuitOpen {
                        endpoint: self.name.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                // Trial calls are serialized; concurrent callers fail fast.
                if inner.half_open_in_flight > 0 {
                    inner.rejections += 1;
                    Err(IngestError::CircuitOpen {
                        endpoint: self.name.clone(),
                    })
                } else {
                    inner.half_open_in_flight += 1;
                    inner.total_calls += 1;
                    Ok(())
                }
            }
        }
    }

    fn settle(&self, outcome: Outcome) {
        let mut inner = self.inner.lock();
        match outcome {
            Outcome::Success => {
                inner.total_successes += 1;
                match inner.state {
                    BreakerState::Closed => inner.consecutive_failures = 0,
                    BreakerState::HalfOpen => {
                        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                        inner.half_open_successes += 1;
                        if inner.half_open_successes >= self.config.success_threshold {
                            info!(breaker = %self.name, "closing circuit");
                            inner.state = BreakerState::Closed;
                            inner.consecutive_failures = 0;
                            inner.opened_at = None;
                        }
                    }
                    BreakerState::Open => {}
                }
            }
            Outcome::Failure => {
                inner.total_failures += 1;
                match inner.state {
                    BreakerState::Closed => {
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.config.failure_threshold {
                            info!(
                                breaker = %self.name,
                                failures = inner.consecutive_failures,
                                "opening circuit"
                            );
                            inner.state = BreakerState::Open;
                            inner.opened_at = Some(Instant::now());
                        }
                    }
                    BreakerState::HalfOpen => {
                        debug!(breaker = %self.name, "trial call failed, reopening");
                        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                    BreakerState::Open => {}
                }
            }
            Outcome::Ignored => {
                if inner.state == BreakerState::HalfOpen {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let attempts = inner.total_successes + inner.total_failures;
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejections: inner.rejections,
            success_rate: if attempts == 0 {
                1.0
            } else {
                inner.total_successes as f64 / attempts as f64
            },
        }
    }

    /// Administrative reset to CLOSED with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
    }
}

/// Registry of named breakers, one per external endpoint.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut all: Vec<BreakerStats> =
            self.breakers.iter().map(|entry| entry.value().stats()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::endpoint())
    }
}
