pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod manifest;
pub mod orchestration;
pub mod progress;
pub mod resilience;

pub use error::{Error, Result};

pub use crate::core::{Task, TaskError, TaskGraph, TaskId, TaskStatus};
pub use orchestration::{AggregatedResult, Scheduler, SchedulerEvent};
pub use progress::{ProgressPublisher, ProgressSnapshot};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, RetryPolicy};
