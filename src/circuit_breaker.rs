//! Per-supplier circuit breaker.
//!
//! Closed counts consecutive failures and opens at `failure_threshold`.
//! Open rejects every call until `reset_timeout` has passed since the last
//! failure; the switch to HalfOpen happens lazily, on the next state read.
//! HalfOpen lets exactly one trial call through: success closes the
//! breaker, failure reopens it and starts a new window.

use crate::config::CircuitBreakerConfig;
use crate::error::{ClientError, SupplierError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

// Read-only view for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub supplier: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    call_timeout: Duration,
    reset_timeout: Duration,
    failure_count: AtomicU32,
    trial_in_flight: AtomicBool,
    inner: RwLock<BreakerInner>,
}

// Held for the duration of a HalfOpen trial call. Dropping it (including
// when the call is cancelled) lets the next trial through.
pub struct TrialPermit<'a> {
    breaker: Option<&'a CircuitBreaker>,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker {
            breaker.trial_in_flight.store(false, Ordering::SeqCst);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Self::with_durations(
            name,
            config.failure_threshold,
            Duration::from_millis(config.call_timeout_ms),
            Duration::from_millis(config.reset_timeout_ms),
        )
    }

    pub fn with_durations(
        name: impl Into<String>,
        failure_threshold: u32,
        call_timeout: Duration,
        reset_timeout: Duration,
    ) -> Result<Self, ClientError> {
        if failure_threshold == 0 || call_timeout.is_zero() || reset_timeout.is_zero() {
            return Err(ClientError::ConfigError(
                "circuit breaker parameters must be positive".to_string(),
            ));
        }

        Ok(Self {
            name: name.into(),
            failure_threshold,
            call_timeout,
            reset_timeout,
            failure_count: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                last_failure: None,
                last_failure_at: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Current state. An Open breaker whose reset window has elapsed moves
    /// to HalfOpen here.
    pub fn state(&self) -> CircuitState {
        {
            let inner = self.inner.read();
            if inner.state != CircuitState::Open || !self.reset_elapsed(&inner) {
                return inner.state;
            }
        }

        let mut inner = self.inner.write();
        if inner.state == CircuitState::Open && self.reset_elapsed(&inner) {
            inner.state = CircuitState::HalfOpen;
            self.trial_in_flight.store(false, Ordering::SeqCst);
            info!(supplier = %self.name, "Circuit breaker half-open, allowing trial call");
        }
        inner.state
    }

    fn reset_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.reset_timeout)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_failure_at
    }

    /// Time left until an Open breaker admits a trial call.
    pub fn retry_after(&self) -> Option<Duration> {
        self.inner
            .read()
            .last_failure
            .map(|at| self.reset_timeout.saturating_sub(at.elapsed()))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            supplier: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            last_failure_at: self.last_failure_at(),
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Closed {
            info!(supplier = %self.name, from = %inner.state, "Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let mut inner = self.inner.write();
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(supplier = %self.name, failures, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    supplier = %self.name,
                    failures,
                    threshold = self.failure_threshold,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.trial_in_flight.store(false, Ordering::SeqCst);
        let mut inner = self.inner.write();
        inner.state = CircuitState::Closed;
        inner.last_failure = None;
        inner.last_failure_at = None;
        info!(supplier = %self.name, "Circuit breaker reset");
    }

    /// Ask permission for one call. Fails fast while Open, or while a
    /// HalfOpen trial is already running.
    pub fn try_acquire(&self) -> Result<TrialPermit<'_>, SupplierError> {
        match self.state() {
            CircuitState::Closed => Ok(TrialPermit { breaker: None }),
            CircuitState::HalfOpen => {
                if self
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    Ok(TrialPermit {
                        breaker: Some(self),
                    })
                } else {
                    Err(self.open_error(CircuitState::HalfOpen))
                }
            }
            CircuitState::Open => Err(self.open_error(CircuitState::Open)),
        }
    }

    fn open_error(&self, state: CircuitState) -> SupplierError {
        SupplierError::CircuitBreakerOpen {
            supplier: self.name.clone(),
            state,
            retry_after_ms: self.retry_after().map(|d| d.as_millis() as u64),
        }
    }

    /// Run `fut` behind the breaker with the configured call timeout and
    /// record its outcome.
    pub async fn call<F, T>(&self, fut: F) -> Result<T, SupplierError>
    where
        F: Future<Output = Result<T, SupplierError>>,
    {
        let _permit = self.try_acquire()?;

        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if err.trips_breaker() {
                    self.record_failure();
                }
                Err(err)
            }
            Err(_) => {
                self.record_failure();
                Err(SupplierError::Timeout(self.call_timeout.as_millis() as u64))
            }
        }
    }
}
