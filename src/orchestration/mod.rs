//! Orchestration layer: running a task graph to completion.
//!
//! The [`Scheduler`] drives a [`crate::core::TaskGraph`] under a concurrency
//! bound and a run deadline, routing remote calls through per-service
//! circuit breakers and the retry policy. When the run ends the
//! [`ResultsAggregator`] folds completed outputs into one value with the
//! configured [`MergeStrategy`], reporting failed and skipped tasks alongside.

pub mod results;
pub mod scheduler;

pub use results::{
    AggregatedResult, CompletedOutput, DeepMerge, KeyedUnion, MergeStrategy, ResultsAggregator,
    SkippedTask, TaskFailure, WeightedCombination,
};
pub use scheduler::{Scheduler, SchedulerEvent};
