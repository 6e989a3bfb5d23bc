//! Scheduler for dependency-ordered, bounded-concurrency task execution.
//!
//! The Scheduler drives a [`TaskGraph`] to completion from a single loop.
//! Each started task runs in its own tokio task, wrapped by the retry
//! policy and, for remote tasks, the service's circuit breaker. Completions,
//! retry notices and executor progress come back over channels, so the
//! graph and the progress aggregator are only touched by the loop.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::dag::TaskGraph;
use crate::core::executor::{ProgressReporter, TaskContext, TaskExecutor, TaskProgress};
use crate::core::task::{TaskError, TaskId, TaskStatus};
use crate::orchestration::results::{AggregatedResult, MergeStrategy, ResultsAggregator};
use crate::progress::{ProgressAggregator, ProgressConfig, ProgressPublisher, ProgressStatus};
use crate::resilience::{CircuitBreaker, CircuitBreakerRegistry, RetryNotice, RetryPolicy};

/// How long a cancelled executor may keep running to finish its abort path.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These let an embedding application react to a run without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A task took a concurrency slot and began its first attempt.
    TaskStarted { task_id: TaskId },
    /// An attempt failed transiently; another follows after `delay`.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
        error: TaskError,
    },
    TaskCompleted { task_id: TaskId, attempts: u32 },
    TaskFailed { task_id: TaskId, error: TaskError },
    /// The task will never run.
    TaskSkipped { task_id: TaskId, reason: TaskError },
    /// Every task reached a terminal state.
    RunCompleted { run_id: String, is_partial: bool },
}

/// Outcome of one spawned task, as seen by the loop.
#[derive(Debug)]
struct TaskCompletion {
    task_id: TaskId,
    result: Result<Value, TaskError>,
    attempts: u32,
}

type InFlight = BoxFuture<'static, (TaskId, Result<TaskCompletion, JoinError>)>;

/// Channels and limits shared by every task in one run.
struct RunContext {
    deadline: Instant,
    cancel: CancellationToken,
    progress_tx: mpsc::UnboundedSender<TaskProgress>,
    retry_tx: mpsc::UnboundedSender<(TaskId, RetryNotice)>,
}

/// Per-task fractions folded into per-stage fractions.
struct RunProgress {
    aggregator: ProgressAggregator,
    task_fractions: HashMap<TaskId, f64>,
    task_stage: HashMap<TaskId, String>,
    stage_members: HashMap<String, Vec<(TaskId, f64)>>,
}

impl RunProgress {
    fn new(run_id: &str, graph: &TaskGraph, config: ProgressConfig) -> Self {
        let mut task_stage = HashMap::new();
        let mut stage_members: HashMap<String, Vec<(TaskId, f64)>> = HashMap::new();
        for task in graph.all_tasks() {
            task_stage.insert(task.id.clone(), task.stage.clone());
            stage_members
                .entry(task.stage.clone())
                .or_default()
                .push((task.id.clone(), task.stage_weight));
        }

        Self {
            aggregator: ProgressAggregator::for_graph(run_id, graph, config),
            task_fractions: HashMap::new(),
            task_stage,
            stage_members,
        }
    }

    /// Record a task's own fraction and push the resulting stage fraction.
    fn set_task(&mut self, task_id: &TaskId, fraction: f64, message: Option<String>) {
        let Some(stage) = self.task_stage.get(task_id) else {
            return;
        };
        let current = self.task_fractions.entry(task_id.clone()).or_insert(0.0);
        if fraction < *current {
            return;
        }
        *current = fraction;

        let members = self.stage_members.get(stage).map(Vec::as_slice).unwrap_or(&[]);
        let total_weight: f64 = members.iter().map(|(_, w)| *w).sum();
        let fraction_of = |id: &TaskId| self.task_fractions.get(id).copied().unwrap_or(0.0);
        let stage_fraction = if total_weight > 0.0 {
            members.iter().map(|(id, w)| w * fraction_of(id)).sum::<f64>() / total_weight
        } else if members.is_empty() {
            fraction
        } else {
            members.iter().map(|(id, _)| fraction_of(id)).sum::<f64>() / members.len() as f64
        };

        let stage = stage.clone();
        self.aggregator
            .update_with_message(&stage, stage_fraction, message);
    }

    fn mark_stage_error(&mut self, task_id: &TaskId, message: String) {
        if let Some(stage) = self.task_stage.get(task_id) {
            self.aggregator
                .annotate(stage, ProgressStatus::Error, Some(message));
        }
    }
}

/// Scheduler for bounded-concurrency execution of a task graph.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use conductor::core::{from_fn, Task, TaskGraph};
/// use conductor::orchestration::Scheduler;
/// use conductor::progress::ProgressPublisher;
/// use conductor::resilience::{BreakerConfig, CircuitBreakerRegistry, RetryPolicy};
///
/// # async fn example() -> conductor::Result<()> {
/// let mut graph = TaskGraph::build(vec![
///     Task::remote("parse", "llm", from_fn(|_ctx| async { Ok(serde_json::json!(1)) })),
///     Task::local("report", from_fn(|_ctx| async { Ok(serde_json::json!(2)) }))
///         .depends_on("parse"),
/// ])?;
///
/// let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
/// let scheduler = Scheduler::new(RetryPolicy::default(), breakers, ProgressPublisher::new(64));
/// let result = scheduler
///     .execute_all(&mut graph, 4, Duration::from_secs(60))
///     .await;
/// assert!(!result.is_partial);
/// # Ok(())
/// # }
/// ```
pub struct Scheduler {
    retry: RetryPolicy,
    /// Shared across runs; one breaker per remote service.
    breakers: Arc<CircuitBreakerRegistry>,
    publisher: ProgressPublisher,
    progress: ProgressConfig,
    results: ResultsAggregator,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    cancel_grace: Duration,
}

impl Scheduler {
    /// Create a scheduler.
    ///
    /// # Arguments
    ///
    /// * `retry` - Policy wrapped around every task
    /// * `breakers` - Registry supplying each remote service's breaker
    /// * `publisher` - Where progress snapshots for this scheduler's runs go
    pub fn new(
        retry: RetryPolicy,
        breakers: Arc<CircuitBreakerRegistry>,
        publisher: ProgressPublisher,
    ) -> Self {
        Self {
            retry,
            breakers,
            publisher,
            progress: ProgressConfig::default(),
            results: ResultsAggregator::default(),
            event_tx: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_progress_config(mut self, config: ProgressConfig) -> Self {
        self.progress = config;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.results = ResultsAggregator::new(strategy);
        self
    }

    /// Time a timed-out executor gets, after its cancellation token fires,
    /// before its attempt is dropped.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Emit lifecycle events on `event_tx`.
    ///
    /// Events are queued without waiting; when the channel is full they are
    /// dropped so a slow receiver never stalls the run.
    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn publisher(&self) -> &ProgressPublisher {
        &self.publisher
    }

    /// Queue an event without waiting; a full or closed channel drops it.
    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(error) = tx.try_send(event) {
                tracing::debug!(event = ?error.into_inner(), "scheduler event dropped");
            }
        }
    }

    fn publish_due(&self, progress: &mut RunProgress) {
        if let Some(snapshot) = progress.aggregator.poll_emit(Instant::now()) {
            self.publisher.publish(snapshot);
        }
    }

    /// Run every task in `graph` and return the combined result.
    ///
    /// At most `concurrency_limit` tasks run at once (zero counts as one).
    /// The whole run must finish within `deadline`; tasks still running then
    /// fail with `Timeout` and tasks not yet started are skipped.
    ///
    /// This never fails: an invalid graph runs nothing and every task is
    /// reported as skipped with the validation error as its reason.
    pub async fn execute_all(
        &self,
        graph: &mut TaskGraph,
        concurrency_limit: usize,
        deadline: Duration,
    ) -> AggregatedResult {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let limit = concurrency_limit.max(1);
        let run_deadline = started
            .checked_add(deadline)
            .unwrap_or_else(|| far_future(started));

        let mut progress = RunProgress::new(&run_id, graph, self.progress.clone());
        self.publish_due(&mut progress);

        if !graph.is_validated() {
            if let Err(error) = graph.validate() {
                tracing::error!(%run_id, %error, "graph rejected, nothing will run");
                let reason = TaskError::permanent(format!("invalid graph: {}", error));
                for task_id in graph.skip_unstarted(reason.clone()) {
                    self.emit(SchedulerEvent::TaskSkipped {
                        task_id,
                        reason: reason.clone(),
                    });
                }
                return self.finish_run(&run_id, graph, progress);
            }
        }

        tracing::info!(
            %run_id,
            tasks = graph.task_count(),
            limit,
            deadline_ms = deadline.as_millis() as u64,
            "run started"
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let run = RunContext {
            deadline: run_deadline,
            cancel: CancellationToken::new(),
            progress_tx,
            retry_tx,
        };
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut deadline_passed = false;

        loop {
            if !deadline_passed && Instant::now() >= run_deadline {
                deadline_passed = true;
                self.on_deadline(graph, &mut progress, &run, started);
            }

            if !deadline_passed {
                let free = limit.saturating_sub(in_flight.len());
                for (slot, task_id) in graph.ready_tasks().into_iter().enumerate() {
                    if slot >= free {
                        if let Some(task) = graph.get_task_mut(&task_id) {
                            task.mark_ready();
                        }
                        continue;
                    }
                    if let Some(job) = self.start_task(graph, &mut progress, &run, &task_id) {
                        in_flight.push(job);
                        self.emit(SchedulerEvent::TaskStarted { task_id });
                    }
                }
            }

            self.publish_due(&mut progress);

            if in_flight.is_empty() {
                break;
            }

            let next_emit = progress.aggregator.next_emit_at();
            tokio::select! {
                Some((task_id, joined)) = in_flight.next() => {
                    let completion = joined.unwrap_or_else(|error| TaskCompletion {
                        result: Err(TaskError::permanent(format!("task aborted: {}", error))),
                        attempts: graph.get_task(&task_id).map_or(1, |t| t.attempt_count),
                        task_id,
                    });
                    self.on_completion(graph, &mut progress, completion);
                }
                Some(update) = progress_rx.recv() => {
                    // Reports that arrive after the task finished are stale.
                    let running = graph
                        .get_task(&update.task_id)
                        .is_some_and(|t| t.status == TaskStatus::Running);
                    if running {
                        progress.set_task(&update.task_id, update.fraction, update.message);
                    }
                }
                Some((task_id, notice)) = retry_rx.recv() => {
                    self.on_retry_notice(graph, task_id, notice);
                }
                _ = tokio::time::sleep_until(run_deadline), if !deadline_passed => {}
                _ = tokio::time::sleep_until(next_emit.unwrap_or(run_deadline)), if next_emit.is_some() => {}
            }
        }

        // A valid graph leaves nothing behind; guard against it anyway.
        let stranded = graph.skip_unstarted(TaskError::permanent("never became ready"));
        if !stranded.is_empty() {
            tracing::error!(%run_id, count = stranded.len(), "tasks stranded at end of run");
        }

        self.finish_run(&run_id, graph, progress)
    }

    /// Move a ready task to Running and spawn its attempts.
    fn start_task(
        &self,
        graph: &mut TaskGraph,
        progress: &mut RunProgress,
        run: &RunContext,
        task_id: &TaskId,
    ) -> Option<InFlight> {
        let dependency_outputs = Arc::new(graph.dependency_outputs(task_id));
        let task = graph.get_task_mut(task_id)?;
        task.mark_ready();
        task.start();
        task.attempt_count = 1;

        let executor = Arc::clone(task.kind.executor());
        let breaker = task.service().map(|s| self.breakers.get_or_create(s));
        let now = Instant::now();
        let deadline = task
            .timeout
            .and_then(|t| now.checked_add(t))
            .map_or(run.deadline, |d| d.min(run.deadline));

        tracing::info!(
            task_id = %task.id,
            stage = %task.stage,
            service = task.service().unwrap_or("-"),
            "task started"
        );

        let ctx = TaskContext::new(
            task_id.clone(),
            1,
            run.cancel.child_token(),
            dependency_outputs,
            ProgressReporter::new(task_id.clone(), run.progress_tx.clone()),
        );
        let handle = tokio::spawn(run_task(
            task_id.clone(),
            executor,
            breaker,
            self.retry.clone(),
            ctx,
            deadline,
            self.cancel_grace,
            run.retry_tx.clone(),
        ));

        progress.set_task(task_id, 0.0, None);

        let task_id = task_id.clone();
        Some(async move { (task_id, handle.await) }.boxed())
    }

    fn on_retry_notice(&self, graph: &mut TaskGraph, task_id: TaskId, notice: RetryNotice) {
        // A notice can be queued behind its task's completion.
        let Some(task) = graph
            .get_task_mut(&task_id)
            .filter(|t| t.status == TaskStatus::Running)
        else {
            return;
        };
        task.attempt_count = task.attempt_count.max(notice.attempt + 1);
        tracing::info!(
            %task_id,
            attempt = notice.attempt,
            delay_ms = notice.delay.as_millis() as u64,
            error = %notice.error,
            "task retrying"
        );
        self.emit(SchedulerEvent::TaskRetrying {
            task_id,
            attempt: notice.attempt,
            delay: notice.delay,
            error: notice.error,
        });
    }

    fn on_completion(
        &self,
        graph: &mut TaskGraph,
        progress: &mut RunProgress,
        completion: TaskCompletion,
    ) {
        let TaskCompletion {
            task_id,
            result,
            attempts,
        } = completion;
        let Some(task) = graph.get_task_mut(&task_id) else {
            return;
        };
        task.attempt_count = attempts;

        match result {
            Ok(value) => {
                task.complete(value);
                tracing::info!(%task_id, attempts, "task completed");
                progress.set_task(&task_id, 1.0, None);
                self.emit(SchedulerEvent::TaskCompleted { task_id, attempts });
            }
            Err(error) => {
                task.fail(error.clone());
                tracing::warn!(%task_id, attempts, kind = %error.kind(), %error, "task failed");
                progress.mark_stage_error(&task_id, error.to_string());
                progress.set_task(&task_id, 1.0, None);

                let downstream = graph.mark_downstream_skipped(&task_id);
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: task_id.clone(),
                    error,
                });

                for skipped in downstream {
                    let reason = TaskError::DependencyFailed {
                        dependency: task_id.clone(),
                    };
                    self.on_skipped(progress, skipped, reason);
                }
            }
        }
    }

    fn on_skipped(&self, progress: &mut RunProgress, task_id: TaskId, reason: TaskError) {
        tracing::info!(%task_id, %reason, "task skipped");
        progress.mark_stage_error(&task_id, reason.to_string());
        progress.set_task(&task_id, 1.0, None);
        self.emit(SchedulerEvent::TaskSkipped { task_id, reason });
    }

    /// Stop dispatching: skip what has not started and ask running tasks to abort.
    fn on_deadline(
        &self,
        graph: &mut TaskGraph,
        progress: &mut RunProgress,
        run: &RunContext,
        started: Instant,
    ) {
        let reason = TaskError::timeout(started.elapsed());
        tracing::warn!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            running = graph.count_with_status(TaskStatus::Running),
            "run deadline reached"
        );
        run.cancel.cancel();
        for task_id in graph.skip_unstarted(reason.clone()) {
            self.on_skipped(progress, task_id, reason.clone());
        }
    }

    fn finish_run(
        &self,
        run_id: &str,
        graph: &TaskGraph,
        mut progress: RunProgress,
    ) -> AggregatedResult {
        let result = self.results.aggregate(run_id, graph);
        let status = if result.is_partial {
            ProgressStatus::Error
        } else {
            ProgressStatus::Completed
        };
        self.publisher.publish(progress.aggregator.finish(status));

        tracing::info!(
            %run_id,
            completed = result.completed_count(),
            failed = result.failures.len(),
            skipped = result.skipped.len(),
            partial = result.is_partial,
            "run finished"
        );
        self.emit(SchedulerEvent::RunCompleted {
            run_id: run_id.to_string(),
            is_partial: result.is_partial,
        });
        result
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("retry", &self.retry)
            .field("breakers", &self.breakers.len())
            .field("results", &self.results)
            .finish()
    }
}

/// Deadline used when `start + deadline` overflows.
fn far_future(start: Instant) -> Instant {
    start + Duration::from_secs(60 * 60 * 24 * 365)
}

/// All attempts of one task, bounded by the task's deadline.
///
/// At the deadline the task's token is cancelled and the executor gets
/// `grace` to return before the attempt is dropped. Either way the task
/// fails with `Timeout`.
#[allow(clippy::too_many_arguments)]
async fn run_task(
    task_id: TaskId,
    executor: Arc<dyn TaskExecutor>,
    breaker: Option<Arc<CircuitBreaker>>,
    policy: RetryPolicy,
    ctx: TaskContext,
    deadline: Instant,
    grace: Duration,
    retry_tx: mpsc::UnboundedSender<(TaskId, RetryNotice)>,
) -> TaskCompletion {
    let started = Instant::now();
    let cancel = ctx.cancellation_token().clone();
    let attempts = AtomicU32::new(1);
    let notice_id = task_id.clone();

    let attempt_all = policy.run(
        breaker.as_deref(),
        &cancel,
        |attempt| {
            attempts.store(attempt, Ordering::Relaxed);
            let ctx = ctx.with_attempt(attempt);
            let executor = Arc::clone(&executor);
            async move {
                AssertUnwindSafe(executor.execute(ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(TaskError::permanent(format!(
                            "executor panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    })
            }
        },
        |notice| {
            let _ = retry_tx.send((notice_id.clone(), notice.clone()));
        },
    );

    tokio::pin!(attempt_all);

    tokio::select! {
        outcome = &mut attempt_all => {
            // The run deadline cancels through the parent token; an executor
            // that gave up because of it has timed out.
            let result = match outcome.result {
                Err(_) if cancel.is_cancelled() => Err(TaskError::timeout(started.elapsed())),
                result => result,
            };
            TaskCompletion {
                task_id,
                result,
                attempts: outcome.attempts,
            }
        }
        _ = tokio::time::sleep_until(deadline) => {
            let elapsed = started.elapsed();
            cancel.cancel();
            if tokio::time::timeout(grace, &mut attempt_all).await.is_err() {
                tracing::warn!(
                    %task_id,
                    grace_ms = grace.as_millis() as u64,
                    "executor ignored cancellation, attempt dropped"
                );
            }
            TaskCompletion {
                task_id,
                result: Err(TaskError::timeout(elapsed)),
                attempts: attempts.load(Ordering::Relaxed),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
