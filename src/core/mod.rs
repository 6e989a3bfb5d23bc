//! Core domain models for task orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: tasks, the executor contract, and the task graph.

pub mod dag;
pub mod executor;
pub mod task;

pub use dag::TaskGraph;
pub use executor::{from_fn, ProgressReporter, TaskContext, TaskExecutor, TaskProgress};
pub use task::{ErrorKind, Priority, Task, TaskError, TaskId, TaskKind, TaskStatus, TaskSummary};
