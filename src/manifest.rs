//! Graph manifests: task graphs described in TOML or JSON.
//!
//! Tasks run a simulated remote call so a manifest can exercise the
//! scheduler, breakers and retries without a real service:
//!
//! ```toml
//! concurrency_limit = 2
//! merge = "deep_merge"
//!
//! [[task]]
//! id = "parse"
//! stage = "extract"
//! weight = 0.2
//! service = "llm"
//! simulate = { latency_ms = 300, transient_failures = 1, output = { skills = 12 } }
//!
//! [[task]]
//! id = "report"
//! depends_on = ["parse"]
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::dag::TaskGraph;
use crate::core::executor::{TaskContext, TaskExecutor};
use crate::core::task::{Priority, Task, TaskError};
use crate::orchestration::results::{DeepMerge, KeyedUnion, MergeStrategy, WeightedCombination};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    #[default]
    KeyedUnion,
    DeepMerge,
    WeightedCombination,
}

impl MergeKind {
    pub fn strategy(&self) -> Arc<dyn MergeStrategy> {
        match self {
            MergeKind::KeyedUnion => Arc::new(KeyedUnion),
            MergeKind::DeepMerge => Arc::new(DeepMerge),
            MergeKind::WeightedCombination => Arc::new(WeightedCombination),
        }
    }
}

/// Behaviour of a simulated remote call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Simulation {
    /// How long each attempt takes.
    pub latency_ms: u64,
    /// Attempts that fail transiently before one succeeds.
    pub transient_failures: u32,
    /// Fail every attempt permanently with this message.
    pub permanent_failure: Option<String>,
    /// Success payload; defaults to the task id and attempt number.
    pub output: Option<Value>,
    /// Intermediate progress reports spread across the latency.
    pub progress_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Remote service this task calls; omitted for local tasks.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub simulate: Simulation,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides `[scheduler] concurrency_limit` from the config.
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    /// Overrides `[scheduler] deadline_secs` from the config.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub merge: MergeKind,
    #[serde(default, rename = "task", alias = "tasks")]
    pub tasks: Vec<TaskSpec>,
}

impl GraphManifest {
    /// Read a manifest, choosing JSON or TOML by file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        tracing::debug!(path = %path.display(), json = is_json, "loading manifest");
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content)?;
        manifest.check()?;
        Ok(manifest)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(content)?;
        manifest.check()?;
        Ok(manifest)
    }

    fn check(&self) -> Result<()> {
        if let Some(spec) = self.tasks.iter().find(|spec| spec.id.trim().is_empty()) {
            return Err(Error::Manifest(format!(
                "task with empty id (name {:?})",
                spec.name
            )));
        }
        Ok(())
    }

    /// Build and validate the task graph the manifest describes.
    pub fn to_graph(&self) -> Result<TaskGraph> {
        TaskGraph::build(self.tasks.iter().map(TaskSpec::to_task))
    }
}

impl TaskSpec {
    pub fn to_task(&self) -> Task {
        let executor: Arc<dyn TaskExecutor> = Arc::new(SimulatedExecutor::new(self.simulate.clone()));
        let mut task = match &self.service {
            Some(service) => Task::remote(self.id.as_str(), service.as_str(), executor),
            None => Task::local(self.id.as_str(), executor),
        };

        if let Some(name) = &self.name {
            task = task.with_name(name.as_str());
        }
        let stage = self.stage.clone().unwrap_or_else(|| self.id.clone());
        task = task.in_stage(stage, self.weight).with_priority(self.priority);
        if let Some(ms) = self.timeout_ms {
            task = task.with_timeout(Duration::from_millis(ms));
        }
        for dependency in &self.depends_on {
            task = task.depends_on(dependency.as_str());
        }
        task
    }
}

/// Executor standing in for a slow, unreliable remote call.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    simulation: Simulation,
}

impl SimulatedExecutor {
    pub fn new(simulation: Simulation) -> Self {
        Self { simulation }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, ctx: TaskContext) -> std::result::Result<Value, TaskError> {
        let sim = &self.simulation;
        let steps = sim.progress_steps.max(1);
        let step = Duration::from_millis(sim.latency_ms) / steps;

        for done in 1..=steps {
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(TaskError::permanent("cancelled"));
                }
                _ = tokio::time::sleep(step) => {}
            }
            if sim.progress_steps > 0 {
                ctx.report_progress(
                    done as f64 / steps as f64,
                    Some(&format!("step {}/{}", done, steps)),
                );
            }
        }

        if let Some(message) = &sim.permanent_failure {
            return Err(TaskError::permanent(message.clone()));
        }
        if ctx.attempt() <= sim.transient_failures {
            return Err(TaskError::transient(format!(
                "simulated outage on attempt {}",
                ctx.attempt()
            )));
        }

        Ok(sim.output.clone().unwrap_or_else(|| {
            json!({
                "task": ctx.task_id().to_string(),
                "attempt": ctx.attempt(),
            })
        }))
    }
}
