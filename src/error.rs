use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task: {0}")]
    DuplicateTask(TaskId),

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Dangling dependency: task {task} depends on unknown task {missing}")]
    DanglingDependency { task: TaskId, missing: TaskId },

    #[error("Manifest error: {0}")]
    Manifest(String),
}

impl Error {
    /// True for errors raised while building or validating a task graph.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateTask(_)
                | Error::CyclicDependency { .. }
                | Error::DanglingDependency { .. }
        )
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
