//! Scheduling correctness tests.
//!
//! These tests verify dependency ordering, the concurrency bound and
//! failure propagation over whole runs.

use std::time::Duration;

use conductor::core::{ErrorKind, TaskError, TaskGraph, TaskId, TaskStatus};
use conductor::orchestration::SchedulerEvent;
use conductor::Error;

use crate::fixtures::{
    diamond, failing_task, independent_tasks, tracked_task, Tracker, SchedulerHarness,
};

const WORK: Duration = Duration::from_millis(100);
const DEADLINE: Duration = Duration::from_secs(60);

/// Test: Dependencies finish before dependents start
/// Given a diamond a -> {b, c} -> d
/// When the scheduler runs it with room for everything
/// Then a finishes before b and c start, and d starts last
#[tokio::test(start_paused = true)]
async fn test_diamond_respects_dependencies() {
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(diamond(&tracker, WORK)).unwrap();
    let harness = SchedulerHarness::new();

    let result = harness.scheduler.execute_all(&mut graph, 4, DEADLINE).await;

    assert!(!result.is_partial);
    assert_eq!(result.completed_count(), 4);
    assert!(tracker.finished_at("a") < tracker.started_at("b"));
    assert!(tracker.finished_at("a") < tracker.started_at("c"));
    assert!(tracker.finished_at("b") < tracker.started_at("d"));
    assert!(tracker.finished_at("c") < tracker.started_at("d"));
    // b and c are independent and overlap.
    assert_eq!(tracker.peak(), 2);
}

/// Test: Concurrency bound holds
/// Given 6 independent tasks and a limit of 2
/// When the scheduler runs
/// Then never more than 2 run at once, and all complete
#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_respected() {
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(independent_tasks(6, &tracker, WORK)).unwrap();
    let harness = SchedulerHarness::new();

    let result = harness.scheduler.execute_all(&mut graph, 2, DEADLINE).await;

    assert!(!result.is_partial);
    assert_eq!(tracker.peak(), 2);
    assert_eq!(tracker.finishes().len(), 6);
}

/// Test: Limit of one serializes the run
/// Given independent tasks A and B and a limit of 1
/// When the scheduler runs
/// Then A and B never run simultaneously
#[tokio::test(start_paused = true)]
async fn test_single_slot_never_overlaps() {
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(vec![
        tracked_task("A", &tracker, WORK),
        tracked_task("B", &tracker, WORK),
    ])
    .unwrap();
    let harness = SchedulerHarness::new();

    harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;

    assert_eq!(tracker.peak(), 1);
    assert_eq!(tracker.starts(), vec!["A", "B"]);
    assert_eq!(tracker.finishes(), vec!["A", "B"]);
}

/// Test: Zero concurrency is treated as one
#[tokio::test(start_paused = true)]
async fn test_zero_limit_still_progresses() {
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(independent_tasks(3, &tracker, WORK)).unwrap();
    let harness = SchedulerHarness::new();

    let result = harness.scheduler.execute_all(&mut graph, 0, DEADLINE).await;

    assert!(!result.is_partial);
    assert_eq!(tracker.peak(), 1);
}

/// Test: Failure propagates to dependents
/// Given A -> B where A fails permanently
/// When the scheduler runs
/// Then B is skipped without running and only A is reported as failed
#[tokio::test(start_paused = true)]
async fn test_failed_dependency_skips_dependent() {
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(vec![
        failing_task("A", TaskError::permanent("malformed input")),
        tracked_task("B", &tracker, WORK).depends_on("A"),
    ])
    .unwrap();
    let mut harness = SchedulerHarness::new();

    let result = harness.scheduler.execute_all(&mut graph, 2, DEADLINE).await;

    assert!(result.is_partial);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].task_id, TaskId::new("A"));
    assert_eq!(result.failures[0].error_kind, ErrorKind::Permanent);
    assert!(result.is_skipped(&TaskId::new("B")));
    assert!(tracker.starts().is_empty());

    let b = graph.get_task(&TaskId::new("B")).unwrap();
    assert_eq!(b.status, TaskStatus::Skipped);
    assert_eq!(
        b.error,
        Some(TaskError::DependencyFailed {
            dependency: TaskId::new("A")
        })
    );

    let events = harness.drain_events();
    assert!(events.contains(&SchedulerEvent::TaskSkipped {
        task_id: TaskId::new("B"),
        reason: TaskError::DependencyFailed {
            dependency: TaskId::new("A")
        },
    }));
    assert!(matches!(
        events.last(),
        Some(SchedulerEvent::RunCompleted { is_partial: true, .. })
    ));
}

/// Test: Unrelated branches keep running after a failure
/// Given a failing root with a dependent, plus an independent chain
/// When the scheduler runs
/// Then the independent chain completes and its output is merged
#[tokio::test(start_paused = true)]
async fn test_independent_branch_survives_failure() {
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(vec![
        failing_task("bad", TaskError::permanent("boom")),
        tracked_task("after_bad", &tracker, WORK).depends_on("bad"),
        tracked_task("x", &tracker, WORK),
        tracked_task("y", &tracker, WORK).depends_on("x"),
    ])
    .unwrap();
    let harness = SchedulerHarness::new();

    let result = harness.scheduler.execute_all(&mut graph, 2, DEADLINE).await;

    assert!(result.is_partial);
    assert_eq!(result.completed_count(), 2);
    assert_eq!(result.succeeded["x"], "x");
    assert_eq!(result.succeeded["y"], "y");
    assert!(result.succeeded.get("after_bad").is_none());
    assert_eq!(tracker.starts(), vec!["x", "y"]);
}

/// Test: Cycles are rejected before anything runs
/// Given A depends on B and B depends on A
/// When the graph is built
/// Then construction fails naming both tasks
#[tokio::test]
async fn test_cycle_rejected_at_build() {
    let tracker = Tracker::new();
    let err = TaskGraph::build(vec![
        tracked_task("A", &tracker, WORK).depends_on("B"),
        tracked_task("B", &tracker, WORK).depends_on("A"),
    ])
    .unwrap_err();

    match err {
        Error::CyclicDependency { cycle } => {
            assert!(cycle.contains(&TaskId::new("A")));
            assert!(cycle.contains(&TaskId::new("B")));
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected a cycle error, got {:?}", other),
    }
    assert!(tracker.starts().is_empty());
}

/// Test: Every task ends terminal
#[tokio::test(start_paused = true)]
async fn test_all_tasks_terminal_after_run() {
    let tracker = Tracker::new();
    let mut tasks = diamond(&tracker, WORK);
    tasks.push(failing_task("e", TaskError::transient("flaky")).depends_on("d"));
    tasks.push(tracked_task("f", &tracker, WORK).depends_on("e"));
    let mut graph = TaskGraph::build(tasks).unwrap();
    let harness = SchedulerHarness::new();

    let result = harness.scheduler.execute_all(&mut graph, 3, DEADLINE).await;

    assert!(!graph.has_unfinished());
    assert_eq!(result.tasks.len(), 6);
    assert_eq!(
        result.failure_for(&TaskId::new("e")).unwrap().error_kind,
        ErrorKind::RetryExhausted
    );
    assert!(result.is_skipped(&TaskId::new("f")));
}
