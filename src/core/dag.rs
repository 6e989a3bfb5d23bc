//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph` stores tasks as nodes of a petgraph `DiGraph` with an edge
//! from each dependency to its dependent. Tasks may be added in any order;
//! edges are wired as soon as both ends exist. `validate` rejects dangling
//! dependencies and cycles before anything runs.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;

use crate::core::task::{Task, TaskError, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// The task dependency graph.
pub struct TaskGraph {
    /// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Dependencies named by some task but not (yet) present in the graph.
    unresolved: HashMap<TaskId, Vec<NodeIndex>>,
    validated: bool,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            unresolved: HashMap::new(),
            validated: false,
        }
    }

    /// Add every task and validate the result.
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a task to the graph.
    ///
    /// # Errors
    /// Returns `DuplicateTask` if a task with the same id already exists.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let id = task.id.clone();
        let dependencies = task.dependencies.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);

        for dep in dependencies {
            match self.task_index.get(&dep) {
                Some(&dep_index) => {
                    self.graph.add_edge(dep_index, index, ());
                }
                None => self.unresolved.entry(dep).or_default().push(index),
            }
        }

        // Earlier tasks that were waiting on this id can now be wired.
        if let Some(waiting) = self.unresolved.remove(&id) {
            for dependent in waiting {
                self.graph.add_edge(index, dependent, ());
            }
        }

        self.validated = false;
        Ok(index)
    }

    /// Check the graph is runnable.
    ///
    /// # Errors
    /// - `DanglingDependency` if a task depends on an id that was never added
    /// - `CyclicDependency` naming one cycle if the graph is not acyclic
    /// - `Validation` if a stage weight is negative or not finite
    pub fn validate(&mut self) -> Result<()> {
        if let Some(index) = self.graph.node_indices().find(|&index| {
            self.graph[index]
                .dependencies
                .iter()
                .any(|dep| !self.task_index.contains_key(dep))
        }) {
            let task = &self.graph[index];
            let missing = task
                .dependencies
                .iter()
                .find(|dep| !self.task_index.contains_key(*dep))
                .cloned()
                .unwrap_or_else(|| task.id.clone());
            return Err(Error::DanglingDependency {
                task: task.id.clone(),
                missing,
            });
        }

        if let Err(cycle) = toposort(&self.graph, None) {
            return Err(Error::CyclicDependency {
                cycle: self.describe_cycle(cycle.node_id()),
            });
        }

        if let Some(task) = self
            .graph
            .node_weights()
            .find(|task| !task.stage_weight.is_finite() || task.stage_weight < 0.0)
        {
            return Err(Error::Validation(format!(
                "Task {} has invalid stage weight {}",
                task.id, task.stage_weight
            )));
        }

        self.validated = true;
        Ok(())
    }

    /// Whether `validate` has succeeded since the last mutation of the edge set.
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Recover one concrete cycle, in dependency order, for error reporting.
    fn describe_cycle(&self, hint: NodeIndex) -> Vec<TaskId> {
        let components = tarjan_scc(&self.graph);
        let component = components
            .iter()
            .find(|c| c.contains(&hint) && (c.len() > 1 || self.has_self_loop(hint)))
            .or_else(|| {
                components
                    .iter()
                    .find(|c| c.len() > 1 || self.has_self_loop(c[0]))
            });

        let Some(component) = component else {
            return vec![self.graph[hint].id.clone()];
        };

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let start = if members.contains(&hint) {
            hint
        } else {
            component[0]
        };

        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        if !self.walk_back_to(start, start, &members, &mut visited, &mut path) {
            path.push(start);
        }

        // Edges point dependency -> dependent; report "X depends on Y" order.
        path.reverse();
        path.into_iter().map(|i| self.graph[i].id.clone()).collect()
    }

    fn has_self_loop(&self, index: NodeIndex) -> bool {
        self.graph.find_edge(index, index).is_some()
    }

    fn walk_back_to(
        &self,
        current: NodeIndex,
        target: NodeIndex,
        members: &HashSet<NodeIndex>,
        visited: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
            if next == target {
                path.push(target);
                return true;
            }
            if members.contains(&next) && visited.insert(next) {
                path.push(next);
                if self.walk_back_to(next, target, members, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of wired dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&from_idx), Some(&to_idx)) => self.graph.find_edge(from_idx, to_idx).is_some(),
            _ => false,
        }
    }

    /// Tasks the given task depends on.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => {
                let mut found: Vec<NodeIndex> =
                    self.graph.neighbors_directed(index, direction).collect();
                found.sort();
                found.into_iter().map(|i| &self.graph[i]).collect()
            }
            None => Vec::new(),
        }
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    // ========== Scheduling Operations ==========

    /// Tasks that may start now, best first.
    ///
    /// A task qualifies when it is Pending or Ready and every dependency is
    /// Completed. Ordering is by priority, then insertion order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<(NodeIndex, &Task)> = self
            .graph
            .node_indices()
            .map(|index| (index, &self.graph[index]))
            .filter(|(index, task)| {
                task.can_start()
                    && self
                        .graph
                        .neighbors_directed(*index, Direction::Incoming)
                        .all(|dep| self.graph[dep].status == TaskStatus::Completed)
            })
            .collect();

        ready.sort_by_key(|(index, task)| (task.priority, *index));
        ready.into_iter().map(|(_, task)| task.id.clone()).collect()
    }

    /// Cascade Skipped to every transitive dependent of a failed task.
    ///
    /// Safe to call more than once; returns only the tasks newly skipped by
    /// this call.
    pub fn mark_downstream_skipped(&mut self, failed_id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(failed_id) else {
            return Vec::new();
        };

        let mut skipped = Vec::new();
        let mut visited = HashSet::from([start]);
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            let mut dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .collect();
            dependents.sort();

            for dependent in dependents {
                if !visited.insert(dependent) {
                    continue;
                }
                let task = &mut self.graph[dependent];
                let reason = TaskError::DependencyFailed {
                    dependency: failed_id.clone(),
                };
                if task.skip(reason) {
                    skipped.push(task.id.clone());
                }
                queue.push_back(dependent);
            }
        }

        skipped
    }

    /// Skip every task that has not started, e.g. once the run deadline passes.
    pub fn skip_unstarted(&mut self, reason: TaskError) -> Vec<TaskId> {
        self.graph
            .node_weights_mut()
            .filter_map(|task| task.skip(reason.clone()).then(|| task.id.clone()))
            .collect()
    }

    /// True while any task is Pending, Ready or Running.
    pub fn has_unfinished(&self) -> bool {
        self.graph.node_weights().any(|task| !task.is_finished())
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.graph
            .node_weights()
            .filter(|task| task.status == status)
            .count()
    }

    /// Outputs of the completed dependencies of a task.
    pub fn dependency_outputs(&self, id: &TaskId) -> HashMap<TaskId, Value> {
        self.get_dependencies(id)
            .into_iter()
            .filter_map(|dep| dep.result.clone().map(|value| (dep.id.clone(), value)))
            .collect()
    }

    /// Total declared weight per stage, in order of first appearance.
    pub fn stage_weights(&self) -> Vec<(String, f64)> {
        let mut weights: Vec<(String, f64)> = Vec::new();
        for task in self.graph.node_weights() {
            match weights.iter_mut().find(|(stage, _)| *stage == task.stage) {
                Some((_, weight)) => *weight += task.stage_weight,
                None => weights.push((task.stage.clone(), task.stage_weight)),
            }
        }
        weights
    }

    /// Get tasks in topological order (each after all its dependencies).
    ///
    /// Ties are broken by insertion order so the result is deterministic.
    ///
    /// # Errors
    /// Returns `CyclicDependency` if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut frontier: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while !frontier.is_empty() {
            frontier.sort_by(|a, b| b.cmp(a));
            let Some(next) = frontier.pop() else { break };
            order.push(next);
            for dependent in self.graph.neighbors_directed(next, Direction::Outgoing) {
                in_degree[dependent.index()] -= 1;
                if in_degree[dependent.index()] == 0 {
                    frontier.push(dependent);
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let stuck = self
                .graph
                .node_indices()
                .find(|i| in_degree[i.index()] > 0)
                .unwrap_or_default();
            return Err(Error::CyclicDependency {
                cycle: self.describe_cycle(stuck),
            });
        }

        Ok(order.into_iter().map(|i| &self.graph[i]).collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("validated", &self.validated)
            .finish()
    }
}
