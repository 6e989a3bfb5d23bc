//! Progress stream tests.
//!
//! Subscribers see weighted, monotonic, throttled snapshots and always
//! receive a final snapshot at 1.0.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conductor::core::{from_fn, Task, TaskError, TaskGraph};
use conductor::orchestration::Scheduler;
use conductor::progress::{ProgressConfig, ProgressPublisher, ProgressSnapshot, ProgressStatus};
use conductor::resilience::{CircuitBreakerRegistry, RetryPolicy};

use crate::fixtures::{failing_task, tracked_task, Tracker};

const DEADLINE: Duration = Duration::from_secs(60);

fn scheduler(publisher: &ProgressPublisher, min_interval: Duration) -> Scheduler {
    Scheduler::new(
        RetryPolicy::no_retry(),
        Arc::new(CircuitBreakerRegistry::default()),
        publisher.clone(),
    )
    .with_progress_config(ProgressConfig {
        min_interval,
    })
}

/// Local task that reports `steps` evenly spaced fractions over `work`.
fn reporting_task(id: &str, steps: u32, work: Duration) -> Task {
    Task::local(
        id,
        from_fn(move |ctx| async move {
            for done in 1..=steps {
                tokio::time::sleep(work / steps).await;
                ctx.report_progress(done as f64 / steps as f64, Some("working"));
            }
            Ok(json!(steps))
        }),
    )
}

fn collect(sub: &mut conductor::progress::ProgressSubscription) -> Vec<ProgressSnapshot> {
    let mut snapshots = Vec::new();
    while let Some(snapshot) = sub.try_recv() {
        snapshots.push(snapshot);
    }
    snapshots
}

/// Test: Overall progress never decreases and ends at exactly 1.0
/// Given three weighted stages
/// When the run completes
/// Then every snapshot is >= the one before and the last is 1.0 Completed
#[tokio::test(start_paused = true)]
async fn test_progress_monotonic_and_final() {
    let publisher = ProgressPublisher::new(1024);
    let mut sub = publisher.subscribe();
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(vec![
        tracked_task("extract", &tracker, Duration::from_millis(100)).in_stage("extract", 0.2),
        reporting_task("analyze", 4, Duration::from_millis(400))
            .in_stage("analyze", 0.5)
            .depends_on("extract"),
        tracked_task("report", &tracker, Duration::from_millis(100))
            .in_stage("report", 0.3)
            .depends_on("analyze"),
    ])
    .unwrap();

    scheduler(&publisher, Duration::from_millis(10))
        .execute_all(&mut graph, 2, DEADLINE)
        .await;

    let snapshots = collect(&mut sub);
    assert!(snapshots.len() >= 3, "got {} snapshots", snapshots.len());
    for pair in snapshots.windows(2) {
        assert!(pair[1].overall_progress >= pair[0].overall_progress);
    }

    let last = snapshots.last().unwrap();
    assert!(last.is_final());
    assert_eq!(last.overall_progress, 1.0);
    assert_eq!(last.status, ProgressStatus::Completed);
    assert_eq!(
        last.per_stage.keys().cloned().collect::<Vec<_>>(),
        vec!["analyze", "extract", "report"]
    );
    assert!(last.per_stage.values().all(|s| s.progress == 1.0));
}

/// Test: Executor progress is visible mid-run
#[tokio::test(start_paused = true)]
async fn test_executor_progress_reaches_subscribers() {
    let publisher = ProgressPublisher::new(1024);
    let mut sub = publisher.subscribe();
    let mut graph = TaskGraph::build(vec![reporting_task(
        "crunch",
        4,
        Duration::from_millis(400),
    )
    .in_stage("crunch", 1.0)])
    .unwrap();

    scheduler(&publisher, Duration::from_millis(10))
        .execute_all(&mut graph, 1, DEADLINE)
        .await;

    let snapshots = collect(&mut sub);
    let midway: Vec<f64> = snapshots
        .iter()
        .map(|s| s.overall_progress)
        .filter(|p| *p > 0.0 && *p < 1.0)
        .collect();
    assert!(!midway.is_empty(), "no intermediate progress observed");
    assert!(snapshots
        .iter()
        .any(|s| s.per_stage["crunch"].message.as_deref() == Some("working")));
}

/// Test: Emissions are throttled
/// Given a min interval far longer than the run
/// When a task reports many updates
/// Then subscribers only see the opening and final snapshots
#[tokio::test(start_paused = true)]
async fn test_updates_throttled_to_min_interval() {
    let publisher = ProgressPublisher::new(1024);
    let mut sub = publisher.subscribe();
    let mut graph = TaskGraph::build(vec![reporting_task(
        "chatty",
        20,
        Duration::from_millis(200),
    )])
    .unwrap();

    scheduler(&publisher, Duration::from_secs(10))
        .execute_all(&mut graph, 1, DEADLINE)
        .await;

    let snapshots = collect(&mut sub);
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].overall_progress, 0.0);
    assert!(snapshots[1].is_final());
}

/// Test: A partial run still finishes at 1.0, flagged as Error
#[tokio::test(start_paused = true)]
async fn test_partial_run_final_snapshot() {
    let publisher = ProgressPublisher::new(1024);
    let mut sub = publisher.subscribe();
    let tracker = Tracker::new();
    let mut graph = TaskGraph::build(vec![
        failing_task("a", TaskError::permanent("bad")).in_stage("first", 0.5),
        tracked_task("b", &tracker, Duration::from_millis(10))
            .in_stage("second", 0.5)
            .depends_on("a"),
    ])
    .unwrap();

    scheduler(&publisher, Duration::from_millis(10))
        .execute_all(&mut graph, 2, DEADLINE)
        .await;

    let last = collect(&mut sub).pop().unwrap();
    assert_eq!(last.overall_progress, 1.0);
    assert_eq!(last.status, ProgressStatus::Error);
    assert_eq!(last.per_stage["first"].status, ProgressStatus::Error);
}

/// Test: Late subscribers can read the latest snapshot
#[tokio::test(start_paused = true)]
async fn test_latest_snapshot_for_late_subscriber() {
    let publisher = ProgressPublisher::new(16);
    let mut graph = TaskGraph::build(vec![reporting_task(
        "only",
        2,
        Duration::from_millis(20),
    )])
    .unwrap();

    scheduler(&publisher, Duration::from_millis(10))
        .execute_all(&mut graph, 1, DEADLINE)
        .await;

    let latest = publisher.latest().unwrap();
    assert!(latest.is_final());
    let message = latest.to_message();
    assert_eq!(message["overall_progress"], 1.0);
    assert_eq!(message["status"], "completed");
    assert_eq!(message["task_id"], json!(latest.run_id));
}
