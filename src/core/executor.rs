//! Executor contract for task work.
//!
//! An executor performs one attempt of a task. It is invoked once per
//! attempt with a fresh [`TaskContext`], must be safe to re-run after a
//! failed attempt, and must stop promptly once the context's cancellation
//! token fires.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::task::{TaskError, TaskId};

/// Capability interface shared by every task kind.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt of the task.
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TaskError>;
}

/// Intermediate progress reported by a running executor.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub task_id: TaskId,
    /// Fraction of this task's work done, in `[0, 1]`.
    pub fraction: f64,
    pub message: Option<String>,
}

/// Sends intermediate progress from an executor back to the scheduler.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    tx: Option<mpsc::UnboundedSender<TaskProgress>>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, tx: mpsc::UnboundedSender<TaskProgress>) -> Self {
        Self {
            task_id,
            tx: Some(tx),
        }
    }

    /// A reporter that discards everything.
    pub fn noop(task_id: TaskId) -> Self {
        Self { task_id, tx: None }
    }

    pub fn report(&self, fraction: f64, message: Option<&str>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TaskProgress {
                task_id: self.task_id.clone(),
                fraction: fraction.clamp(0.0, 1.0),
                message: message.map(str::to_string),
            });
        }
    }
}

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    attempt: u32,
    cancel: CancellationToken,
    dependency_outputs: Arc<HashMap<TaskId, Value>>,
    progress: ProgressReporter,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        attempt: u32,
        cancel: CancellationToken,
        dependency_outputs: Arc<HashMap<TaskId, Value>>,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            task_id,
            attempt,
            cancel,
            dependency_outputs,
            progress,
        }
    }

    /// Context for running an executor outside the scheduler.
    pub fn detached(task_id: TaskId) -> Self {
        Self {
            progress: ProgressReporter::noop(task_id.clone()),
            task_id,
            attempt: 1,
            cancel: CancellationToken::new(),
            dependency_outputs: Arc::new(HashMap::new()),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run asks this attempt to abort.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Output of a completed dependency.
    pub fn dependency_output(&self, id: &TaskId) -> Option<&Value> {
        self.dependency_outputs.get(id)
    }

    pub fn dependency_outputs(&self) -> &HashMap<TaskId, Value> {
        &self.dependency_outputs
    }

    pub fn report_progress(&self, fraction: f64, message: Option<&str>) {
        self.progress.report(fraction, message);
    }
}

/// Executor backed by an async closure.
pub struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable executor.
///
/// ```
/// use conductor::core::executor::from_fn;
///
/// let executor = from_fn(|ctx| async move {
///     Ok(serde_json::json!({ "task": ctx.task_id().to_string() }))
/// });
/// # let _ = executor;
/// ```
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}
