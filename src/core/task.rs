//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of schedulable work. Each task names its
//! dependencies, the stage it reports progress under, and the executor
//! that performs the (usually remote) call. The scheduler records status,
//! attempts, timing and the typed outcome back onto the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::executor::TaskExecutor;

/// Unique identifier for a task within a graph.
///
/// Callers usually pick readable ids ("parse", "score-skills"); `generate`
/// produces a UUID-based id when the caller has none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new unique task identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Scheduling priority among simultaneously ready tasks.
///
/// Variants are declared highest first so that sorting ascending puts
/// `High` at the front.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Ready -> Running -> {Completed, Failed}`; a task whose
/// dependency failed goes straight from `Pending`/`Ready` to `Skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a concurrency slot.
    Ready,
    /// Holding a concurrency slot and executing.
    Running,
    Completed,
    Failed,
    /// Never ran because a dependency failed or the run deadline passed.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Coarse classification of a task failure, serialized with the names
/// used in failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "TransientError")]
    Transient,
    #[serde(rename = "PermanentError")]
    Permanent,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "CircuitOpenError")]
    CircuitOpen,
    #[serde(rename = "RetryExhaustedError")]
    RetryExhausted,
    #[serde(rename = "Skipped")]
    Skipped,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transient => "TransientError",
            ErrorKind::Permanent => "PermanentError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::CircuitOpen => "CircuitOpenError",
            ErrorKind::RetryExhausted => "RetryExhaustedError",
            ErrorKind::Skipped => "Skipped",
        };
        write!(f, "{}", name)
    }
}

/// Typed failure of a single task.
///
/// These are values, not panics: the scheduler records them on the task
/// and keeps running the rest of the graph.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskError {
    /// Retryable failure (network blip, rate limit).
    #[error("transient error: {message}")]
    Transient { message: String },

    /// Non-retryable failure (invalid input, authorization).
    #[error("permanent error: {message}")]
    Permanent { message: String },

    #[error("deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("circuit open for service {service}")]
    CircuitOpen { service: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("dependency {dependency} did not complete")]
    DependencyFailed { dependency: TaskId },
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout {
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Transient { .. } => ErrorKind::Transient,
            TaskError::Permanent { .. } => ErrorKind::Permanent,
            TaskError::Timeout { .. } => ErrorKind::Timeout,
            TaskError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            TaskError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            TaskError::DependencyFailed { .. } => ErrorKind::Skipped,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient { .. })
    }

    /// Whether this failure says something about the health of the
    /// remote service, and so counts against its circuit breaker.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, TaskError::Transient { .. } | TaskError::Timeout { .. })
    }
}

/// What kind of work a task performs.
#[derive(Clone)]
pub enum TaskKind {
    /// Calls a named external service; guarded by that service's breaker.
    Remote {
        service: String,
        executor: Arc<dyn TaskExecutor>,
    },
    /// Runs in-process with no external dependency to protect.
    Local { executor: Arc<dyn TaskExecutor> },
}

impl TaskKind {
    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        match self {
            TaskKind::Remote { executor, .. } | TaskKind::Local { executor } => executor,
        }
    }

    /// Name of the guarded external service, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            TaskKind::Remote { service, .. } => Some(service),
            TaskKind::Local { .. } => None,
        }
    }
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Remote { service, .. } => {
                f.debug_struct("Remote").field("service", service).finish()
            }
            TaskKind::Local { .. } => f.debug_struct("Local").finish(),
        }
    }
}

/// A single task in the execution graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Human-readable name; defaults to the id.
    pub name: String,
    /// Ids of tasks that must complete before this one may start.
    pub dependencies: Vec<TaskId>,
    pub priority: Priority,
    /// Progress stage this task reports under; defaults to the id.
    pub stage: String,
    /// Relative share of overall progress; normalized across the graph.
    pub stage_weight: f64,
    /// Optional per-task time budget, measured from start.
    pub timeout: Option<Duration>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task with the given id and kind.
    ///
    /// The task starts Pending with weight 1.0 in a stage named after its id.
    pub fn new(id: impl Into<TaskId>, kind: TaskKind) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            stage: id.to_string(),
            id,
            dependencies: Vec::new(),
            priority: Priority::Normal,
            stage_weight: 1.0,
            timeout: None,
            kind,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a task that calls the named external service.
    pub fn remote(
        id: impl Into<TaskId>,
        service: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self::new(
            id,
            TaskKind::Remote {
                service: service.into(),
                executor,
            },
        )
    }

    /// Create a task that runs without a guarded dependency.
    pub fn local(id: impl Into<TaskId>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self::new(id, TaskKind::Local { executor })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a dependency; repeated ids are ignored.
    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_stage(mut self, stage: impl Into<String>, weight: f64) -> Self {
        self.stage = stage.into();
        self.stage_weight = weight;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.stage_weight = weight;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Transition Pending -> Ready.
    pub fn mark_ready(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Ready;
        }
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully completed with its payload.
    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with a typed error.
    pub fn fail(&mut self, error: TaskError) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Mark a not-yet-started task as skipped.
    ///
    /// Returns false, leaving the task untouched, if it already started or
    /// finished; this keeps cascades idempotent.
    pub fn skip(&mut self, reason: TaskError) -> bool {
        if !self.can_start() {
            return false;
        }
        self.status = TaskStatus::Skipped;
        self.error = Some(reason);
        self.completed_at = Some(Utc::now());
        true
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task can still be started (Pending or Ready).
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }

    pub fn service(&self) -> Option<&str> {
        self.kind.service()
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            stage: self.stage.clone(),
            status: self.status,
            attempt_count: self.attempt_count,
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Serializable view of a task after (or during) a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub stage: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
