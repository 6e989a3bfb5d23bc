//! Resilience patterns guarding calls to external services.
//!
//! - [`breaker`] - per-service circuit breakers and their shared registry
//! - [`retry`] - exponential backoff with jitter around a single task

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerConfig, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
    Permit,
};
pub use retry::{RetryNotice, RetryOutcome, RetryPolicy};
