//! Assembling a best-effort result from a finished graph.
//!
//! Completed outputs are combined by a pluggable [`MergeStrategy`]; failed
//! and skipped tasks are itemized alongside. Aggregation cannot fail.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::dag::TaskGraph;
use crate::core::task::{ErrorKind, Task, TaskId, TaskStatus, TaskSummary};

static NULL: Value = Value::Null;

/// One completed task's output, handed to a merge strategy.
#[derive(Debug, Clone, Copy)]
pub struct CompletedOutput<'a> {
    pub task_id: &'a TaskId,
    pub stage: &'a str,
    pub weight: f64,
    pub value: &'a Value,
}

/// Policy for combining completed outputs into one payload.
///
/// Outputs arrive in dependency order: every task after its dependencies.
/// With no outputs a strategy must return an empty object.
pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(&self, outputs: &[CompletedOutput<'_>]) -> Value;
}

/// An object mapping each task id to its output.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedUnion;

impl MergeStrategy for KeyedUnion {
    fn name(&self) -> &'static str {
        "keyed_union"
    }

    fn merge(&self, outputs: &[CompletedOutput<'_>]) -> Value {
        Value::Object(
            outputs
                .iter()
                .map(|o| (o.task_id.to_string(), o.value.clone()))
                .collect(),
        )
    }
}

/// Object outputs merged recursively; later tasks win on conflicting leaves.
///
/// A non-object output is stored under its task id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepMerge;

impl DeepMerge {
    fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
        for (key, value) in source {
            match (target.get_mut(key), value) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    Self::merge_into(existing, incoming);
                }
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

impl MergeStrategy for DeepMerge {
    fn name(&self) -> &'static str {
        "deep_merge"
    }

    fn merge(&self, outputs: &[CompletedOutput<'_>]) -> Value {
        let mut merged = Map::new();
        for output in outputs {
            match output.value {
                Value::Object(fields) => Self::merge_into(&mut merged, fields),
                other => {
                    merged.insert(output.task_id.to_string(), other.clone());
                }
            }
        }
        Value::Object(merged)
    }
}

/// Numeric fields combined as a weighted mean, using each task's stage weight.
///
/// A bare numeric output counts as the field `value`. Non-numeric fields
/// are ignored. If every contributor to a field has zero weight, they
/// count equally.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedCombination;

impl MergeStrategy for WeightedCombination {
    fn name(&self) -> &'static str {
        "weighted_combination"
    }

    fn merge(&self, outputs: &[CompletedOutput<'_>]) -> Value {
        // field -> (sum of weight * value, sum of weight, plain sum, count)
        let mut fields: Vec<(String, f64, f64, f64, usize)> = Vec::new();

        let mut add = |name: &str, number: f64, weight: f64| {
            match fields.iter_mut().find(|(field, ..)| field == name) {
                Some(entry) => {
                    entry.1 += weight * number;
                    entry.2 += weight;
                    entry.3 += number;
                    entry.4 += 1;
                }
                None => fields.push((name.to_string(), weight * number, weight, number, 1)),
            }
        };

        for output in outputs {
            let weight = if output.weight.is_finite() {
                output.weight.max(0.0)
            } else {
                0.0
            };
            match output.value {
                Value::Object(map) => {
                    for (key, value) in map {
                        if let Some(number) = value.as_f64() {
                            add(key, number, weight);
                        }
                    }
                }
                other => {
                    if let Some(number) = other.as_f64() {
                        add("value", number, weight);
                    }
                }
            }
        }

        let combined: Map<String, Value> = fields
            .into_iter()
            .filter_map(|(name, weighted, total_weight, plain, count)| {
                let mean = if total_weight > 0.0 {
                    weighted / total_weight
                } else {
                    plain / count as f64
                };
                serde_json::Number::from_f64(mean).map(|n| (name, Value::Number(n)))
            })
            .collect();
        Value::Object(combined)
    }
}

/// A task that ran and failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// A task that never ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTask {
    pub task_id: TaskId,
    pub reason: String,
}

/// Combined outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub run_id: String,
    /// Merged payload of every Completed task.
    pub succeeded: Value,
    pub failures: Vec<TaskFailure>,
    pub skipped: Vec<SkippedTask>,
    /// True when any task Failed or was Skipped.
    pub is_partial: bool,
    pub tasks: Vec<TaskSummary>,
}

impl AggregatedResult {
    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    pub fn failure_for(&self, task_id: &TaskId) -> Option<&TaskFailure> {
        self.failures.iter().find(|f| &f.task_id == task_id)
    }

    pub fn is_skipped(&self, task_id: &TaskId) -> bool {
        self.skipped.iter().any(|s| &s.task_id == task_id)
    }
}

/// Builds an [`AggregatedResult`] from a graph whose run has ended.
#[derive(Clone)]
pub struct ResultsAggregator {
    strategy: Arc<dyn MergeStrategy>,
}

impl ResultsAggregator {
    pub fn new(strategy: Arc<dyn MergeStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Merge completed outputs and itemize everything else.
    ///
    /// A task still Pending, Ready or Running here is reported as skipped.
    pub fn aggregate(&self, run_id: &str, graph: &TaskGraph) -> AggregatedResult {
        let ordered: Vec<&Task> = graph
            .topological_order()
            .unwrap_or_else(|_| graph.all_tasks().collect());

        let outputs: Vec<CompletedOutput<'_>> = ordered
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .map(|task| CompletedOutput {
                task_id: &task.id,
                stage: &task.stage,
                weight: task.stage_weight,
                value: task.result.as_ref().unwrap_or(&NULL),
            })
            .collect();
        let succeeded = self.strategy.merge(&outputs);

        let mut failures = Vec::new();
        let mut skipped = Vec::new();
        for task in graph.all_tasks() {
            match task.status {
                TaskStatus::Completed => {}
                TaskStatus::Failed => {
                    let (error_kind, message) = match &task.error {
                        Some(error) => (error.kind(), error.to_string()),
                        None => (ErrorKind::Permanent, "failed without error".to_string()),
                    };
                    failures.push(TaskFailure {
                        task_id: task.id.clone(),
                        error_kind,
                        message,
                    });
                }
                TaskStatus::Skipped => skipped.push(SkippedTask {
                    task_id: task.id.clone(),
                    reason: task
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "skipped".to_string()),
                }),
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running => {
                    skipped.push(SkippedTask {
                        task_id: task.id.clone(),
                        reason: format!("not run (still {})", task.status),
                    })
                }
            }
        }

        AggregatedResult {
            run_id: run_id.to_string(),
            succeeded,
            is_partial: !failures.is_empty() || !skipped.is_empty(),
            failures,
            skipped,
            tasks: graph.all_tasks().map(Task::summary).collect(),
        }
    }
}

impl Default for ResultsAggregator {
    fn default() -> Self {
        Self::new(Arc::new(KeyedUnion))
    }
}

impl std::fmt::Debug for ResultsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultsAggregator")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}
