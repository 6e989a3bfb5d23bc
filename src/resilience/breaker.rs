//! Per-service circuit breakers.
//!
//! A breaker is Closed while its service is healthy, Open (fail fast)
//! after `failure_threshold` consecutive counted failures, and HalfOpen
//! once `reset_timeout` has passed since the last failure. In HalfOpen a
//! limited number of trial calls go through; a success closes the circuit
//! and a failure opens it again.
//!
//! Every transition happens under the breaker's own lock, so breakers can
//! be shared freely between concurrent runs.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::task::TaskError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a trial is allowed.
    pub reset_timeout: Duration,
    /// Concurrent trial calls allowed while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub times_opened: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_failure_at: None,
            half_open_in_flight: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            times_opened: 0,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Must be handed back through `record_success`, `record_failure` or
/// `release` so half-open trial slots are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Permit {
    trial: bool,
}

impl Permit {
    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Returns the permit uncounted if a call is dropped before it finishes.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.release(permit);
        }
    }
}

/// Circuit breaker guarding one named service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // No code path panics while holding the lock; recover anyway.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, moving Open to HalfOpen if the reset timeout elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .last_failure_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed >= self.config.reset_timeout {
            tracing::info!(service = %self.service, "circuit half-open, allowing trial");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
        }
    }

    /// Ask to make a call.
    ///
    /// # Errors
    /// Returns `CircuitOpen` while the circuit is Open, or HalfOpen with
    /// every trial slot taken. The rejection is not counted as a failure.
    pub fn try_acquire(&self) -> Result<Permit, TaskError> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        let permit = match inner.state {
            CircuitState::Closed => Some(Permit { trial: false }),
            CircuitState::HalfOpen
                if inner.half_open_in_flight < self.config.half_open_max_calls.max(1) =>
            {
                inner.half_open_in_flight += 1;
                Some(Permit { trial: true })
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        };

        match permit {
            Some(permit) => {
                inner.total_calls += 1;
                Ok(permit)
            }
            None => {
                inner.rejected_calls += 1;
                tracing::debug!(service = %self.service, state = %inner.state, "call rejected");
                Err(TaskError::CircuitOpen {
                    service: self.service.clone(),
                })
            }
        }
    }

    /// Record a successful call: resets the failure count and closes the circuit.
    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.lock();
        if permit.trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.total_successes += 1;
        inner.failure_count = 0;
        if inner.state != CircuitState::Closed {
            tracing::info!(service = %self.service, "circuit closed");
            inner.state = CircuitState::Closed;
            inner.half_open_in_flight = 0;
        }
    }

    /// Record a failed call, opening the circuit once the threshold is reached
    /// or immediately if the call was a half-open trial.
    pub fn record_failure(&self, permit: Permit) {
        let mut inner = self.lock();
        if permit.trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.total_failures += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        let should_open = match inner.state {
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold.max(1),
            CircuitState::HalfOpen => true,
            // A call admitted before the circuit opened; keep the window fresh.
            CircuitState::Open => false,
        };

        if should_open {
            tracing::warn!(
                service = %self.service,
                failures = inner.failure_count,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.half_open_in_flight = 0;
            inner.times_opened += 1;
        }
    }

    /// Return a permit without counting the call either way.
    pub fn release(&self, permit: Permit) {
        if permit.trial {
            let mut inner = self.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails with `CircuitOpen` without invoking `operation` when the
    /// circuit rejects the call. Only errors for which
    /// [`TaskError::counts_against_breaker`] holds are recorded as failures.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut guard = PermitGuard {
            breaker: self,
            permit: Some(self.try_acquire()?),
        };
        let result = operation().await;
        if let Some(permit) = guard.permit.take() {
            match &result {
                Ok(_) => self.record_success(permit),
                Err(error) if error.counts_against_breaker() => self.record_failure(permit),
                Err(_) => self.release(permit),
            }
        }
        result
    }

    /// Force the breaker back to Closed with a clean failure count.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.half_open_in_flight = 0;
        tracing::info!(service = %self.service, "circuit reset");
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            times_opened: inner.times_opened,
            last_failure_at: inner.last_failure_at,
        }
    }
}

/// Process-wide set of breakers, one per service name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The breaker for `service`, created on first use.
    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        Arc::clone(
            breakers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config.clone()))),
        )
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(service).cloned()
    }

    /// Current state of every known breaker, by service name.
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.snapshot()
            .into_iter()
            .map(|breaker| (breaker.service.clone(), breaker.state()))
            .collect()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.snapshot().iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Copy the handles out so breaker locks are never taken under the map lock.
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.lock().values().cloned().collect()
    }
}
