//! Weighted, monotonic progress aggregation.
//!
//! Stages carry relative weights that are normalized on construction, so
//! callers never need weights that sum to exactly 1.0. Each stage only
//! moves forward, and the overall figure never decreases within a run.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::core::dag::TaskGraph;

/// Overall or per-stage status carried by a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Initializing,
    InProgress,
    Completed,
    Error,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressStatus::Initializing => write!(f, "initializing"),
            ProgressStatus::InProgress => write!(f, "in_progress"),
            ProgressStatus::Completed => write!(f, "completed"),
            ProgressStatus::Error => write!(f, "error"),
        }
    }
}

/// Emission tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressConfig {
    /// Minimum gap between two emitted snapshots (first and last exempt).
    pub min_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub progress: f64,
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Immutable view of a run's progress at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(rename = "task_id")]
    pub run_id: String,
    pub overall_progress: f64,
    pub status: ProgressStatus,
    pub current_stage: String,
    #[serde(rename = "stages")]
    pub per_stage: BTreeMap<String, StageProgress>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// The message pushed to subscribers.
    pub fn to_message(&self) -> Value {
        let stages: serde_json::Map<String, Value> = self
            .per_stage
            .iter()
            .map(|(name, stage)| {
                (
                    name.clone(),
                    json!({
                        "progress": stage.progress,
                        "status": stage.status,
                        "message": stage.message,
                    }),
                )
            })
            .collect();

        json!({
            "task_id": self.run_id,
            "overall_progress": self.overall_progress,
            "status": self.status,
            "current_stage": self.current_stage,
            "stages": stages,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self.status,
            ProgressStatus::Completed | ProgressStatus::Error
        ) && self.overall_progress >= 1.0
    }
}

#[derive(Debug, Clone)]
struct Stage {
    name: String,
    weight: f64,
    progress: f64,
    status: ProgressStatus,
    message: Option<String>,
}

/// Turns per-stage fractions into one weighted overall figure.
#[derive(Debug)]
pub struct ProgressAggregator {
    run_id: String,
    config: ProgressConfig,
    stages: Vec<Stage>,
    overall: f64,
    status: ProgressStatus,
    current_stage: String,
    last_emit: Option<Instant>,
    dirty: bool,
    finished: bool,
}

impl ProgressAggregator {
    /// Create an aggregator over `(stage, weight)` pairs.
    ///
    /// Weights are normalized to sum to 1.0; if they are all zero every
    /// stage gets an equal share. Repeated stage names are merged.
    pub fn new(
        run_id: impl Into<String>,
        stage_weights: impl IntoIterator<Item = (String, f64)>,
        config: ProgressConfig,
    ) -> Self {
        let mut stages: Vec<Stage> = Vec::new();
        for (name, weight) in stage_weights {
            let weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
            match stages.iter_mut().find(|s| s.name == name) {
                Some(stage) => stage.weight += weight,
                None => stages.push(Stage {
                    name,
                    weight,
                    progress: 0.0,
                    status: ProgressStatus::Initializing,
                    message: None,
                }),
            }
        }

        let total: f64 = stages.iter().map(|s| s.weight).sum();
        let count = stages.len() as f64;
        for stage in &mut stages {
            stage.weight = if total > 0.0 {
                stage.weight / total
            } else {
                1.0 / count
            };
        }

        let current_stage = stages.first().map(|s| s.name.clone()).unwrap_or_default();
        Self {
            run_id: run_id.into(),
            config,
            stages,
            overall: 0.0,
            status: ProgressStatus::Initializing,
            current_stage,
            last_emit: None,
            dirty: true,
            finished: false,
        }
    }

    /// Create an aggregator over the stages declared by a graph's tasks.
    pub fn for_graph(run_id: impl Into<String>, graph: &TaskGraph, config: ProgressConfig) -> Self {
        Self::new(run_id, graph.stage_weights(), config)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn overall_progress(&self) -> f64 {
        self.overall
    }

    /// Normalized weight of a stage.
    pub fn stage_weight(&self, stage: &str) -> Option<f64> {
        self.stages.iter().find(|s| s.name == stage).map(|s| s.weight)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record progress for a stage.
    ///
    /// Returns false, changing nothing, if the stage is unknown, the run
    /// has finished, or `fraction` is below what the stage already reported.
    pub fn update(&mut self, stage: &str, fraction: f64) -> bool {
        self.update_with_message(stage, fraction, None)
    }

    pub fn update_with_message(
        &mut self,
        stage: &str,
        fraction: f64,
        message: Option<String>,
    ) -> bool {
        if self.finished || !fraction.is_finite() {
            return false;
        }
        let Some(entry) = self.stages.iter_mut().find(|s| s.name == stage) else {
            tracing::debug!(stage, "progress for unknown stage ignored");
            return false;
        };

        let fraction = fraction.clamp(0.0, 1.0);
        if fraction < entry.progress {
            tracing::trace!(stage, fraction, current = entry.progress, "regressing update ignored");
            return false;
        }

        entry.progress = fraction;
        if entry.status != ProgressStatus::Error {
            entry.status = if fraction >= 1.0 {
                ProgressStatus::Completed
            } else {
                ProgressStatus::InProgress
            };
        }
        if message.is_some() {
            entry.message = message;
        }

        self.current_stage = stage.to_string();
        if self.status == ProgressStatus::Initializing {
            self.status = ProgressStatus::InProgress;
        }
        self.recompute();
        self.dirty = true;
        true
    }

    /// Set a stage's status and message without moving its fraction.
    pub fn annotate(&mut self, stage: &str, status: ProgressStatus, message: Option<String>) {
        if self.finished {
            return;
        }
        if let Some(entry) = self.stages.iter_mut().find(|s| s.name == stage) {
            entry.status = status;
            if message.is_some() {
                entry.message = message;
            }
            self.dirty = true;
        }
    }

    fn recompute(&mut self) {
        let computed: f64 = self.stages.iter().map(|s| s.weight * s.progress).sum();
        self.overall = self.overall.max(computed.min(1.0));
    }

    /// The current state as an immutable value.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            run_id: self.run_id.clone(),
            overall_progress: self.overall,
            status: self.status,
            current_stage: self.current_stage.clone(),
            per_stage: self
                .stages
                .iter()
                .map(|s| {
                    (
                        s.name.clone(),
                        StageProgress {
                            progress: s.progress,
                            status: s.status,
                            message: s.message.clone(),
                        },
                    )
                })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    /// A snapshot to push now, if any.
    ///
    /// The first call always yields one; after that a snapshot is produced
    /// only when something changed and `min_interval` has passed since the
    /// last emission. Nothing is produced once the run has finished.
    pub fn poll_emit(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        if self.finished || !self.dirty {
            return None;
        }
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.config.min_interval {
                tracing::trace!(run_id = %self.run_id, "progress emission throttled");
                return None;
            }
        }
        self.last_emit = Some(now);
        self.dirty = false;
        Some(self.snapshot())
    }

    /// When a throttled change becomes eligible for emission.
    pub fn next_emit_at(&self) -> Option<Instant> {
        if self.finished || !self.dirty {
            return None;
        }
        self.last_emit.map(|last| last + self.config.min_interval)
    }

    /// Close the run and return the final snapshot, which is always emitted.
    ///
    /// Every stage is brought to 1.0 and the overall figure to exactly 1.0.
    pub fn finish(&mut self, status: ProgressStatus) -> ProgressSnapshot {
        for stage in &mut self.stages {
            stage.progress = 1.0;
            if stage.status != ProgressStatus::Error {
                stage.status = ProgressStatus::Completed;
            }
        }
        self.overall = 1.0;
        self.status = status;
        if let Some(last) = self.stages.last() {
            self.current_stage = last.name.clone();
        }
        self.finished = true;
        self.dirty = false;
        self.snapshot()
    }
}
