//! Retry and circuit breaker tests over whole runs.
//!
//! Breakers live in a registry shared by every run of a scheduler, so
//! these tests also check state carried from one run into the next.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conductor::core::{from_fn, ErrorKind, Task, TaskError, TaskGraph, TaskId};
use conductor::orchestration::SchedulerEvent;
use conductor::resilience::{BreakerConfig, CircuitState, RetryPolicy};

use crate::fixtures::{fast_retry, SchedulerHarness};

const DEADLINE: Duration = Duration::from_secs(60);

fn breaker_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
    }
}

/// Remote task on `service` that fails transiently until `fail_first`
/// calls have been made, counting every call in `calls`.
fn remote_task(id: &str, service: &str, calls: &Arc<AtomicU32>, fail_first: u32) -> Task {
    let calls = Arc::clone(calls);
    Task::remote(
        id,
        service,
        from_fn(move |_ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= fail_first {
                    Err(TaskError::transient(format!("503 on call {}", n)))
                } else {
                    Ok(json!({ "call": n }))
                }
            }
        }),
    )
}

/// Test: Retry succeeds on the third attempt
/// Given a task failing transiently twice
/// When run with an attempt limit of 3
/// Then it completes with attempt_count 3 after two growing backoffs
#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_on_third_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut graph =
        TaskGraph::build(vec![remote_task("fetch", "search", &calls, 2)]).unwrap();
    let mut harness = SchedulerHarness::with(fast_retry(3), breaker_config());

    let result = harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;

    assert!(!result.is_partial);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.succeeded["fetch"]["call"], 3);
    assert_eq!(
        graph.get_task(&TaskId::new("fetch")).unwrap().attempt_count,
        3
    );

    let delays: Vec<Duration> = harness
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SchedulerEvent::TaskRetrying { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
    // Two failures stay under the threshold and the success resets them.
    assert_eq!(harness.breakers.states()["search"], CircuitState::Closed);
}

/// Test: Retries run out
/// Given a task that always fails transiently
/// When run with an attempt limit of 3
/// Then it fails with RetryExhausted after exactly 3 calls
#[tokio::test(start_paused = true)]
async fn test_retry_exhausted() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut graph =
        TaskGraph::build(vec![remote_task("fetch", "search", &calls, u32::MAX)]).unwrap();
    let harness = SchedulerHarness::with(
        fast_retry(3),
        BreakerConfig {
            failure_threshold: 10,
            ..breaker_config()
        },
    );

    let result = harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let failure = result.failure_for(&TaskId::new("fetch")).unwrap();
    assert_eq!(failure.error_kind, ErrorKind::RetryExhausted);
    assert!(failure.message.contains("503 on call 3"));
}

/// Test: Permanent errors are not retried
#[tokio::test(start_paused = true)]
async fn test_permanent_error_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut graph = TaskGraph::build(vec![Task::remote(
        "auth",
        "llm",
        from_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::permanent("401 unauthorized")) }
        }),
    )])
    .unwrap();
    let harness = SchedulerHarness::with(fast_retry(5), breaker_config());

    let result = harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        result.failure_for(&TaskId::new("auth")).unwrap().error_kind,
        ErrorKind::Permanent
    );
    // Permanent errors say nothing about service health.
    let breaker = harness.breakers.get("llm").unwrap();
    assert_eq!(breaker.failure_count(), 0);
}

/// Test: Breaker lifecycle across runs
/// Given a threshold of 3 and a 30s reset timeout
/// When three calls fail, a fourth is attempted, and then time passes
/// Then the breaker opens, rejects without calling, and a successful
///      trial after the timeout closes it again
#[tokio::test(start_paused = true)]
async fn test_breaker_opens_rejects_and_recovers() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = SchedulerHarness::with(RetryPolicy::no_retry(), breaker_config());

    // Run 1: three failures open the circuit.
    let mut graph = TaskGraph::build(vec![
        remote_task("r1", "llm", &calls, 3),
        remote_task("r2", "llm", &calls, 3),
        remote_task("r3", "llm", &calls, 3),
    ])
    .unwrap();
    let result = harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;
    assert_eq!(result.failures.len(), 3);
    assert_eq!(harness.breakers.states()["llm"], CircuitState::Open);

    // Run 2: rejected without reaching the service.
    let mut graph = TaskGraph::build(vec![remote_task("r4", "llm", &calls, 3)]).unwrap();
    let result = harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.failure_for(&TaskId::new("r4")).unwrap().error_kind,
        ErrorKind::CircuitOpen
    );

    // After the reset timeout one trial is let through.
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(harness.breakers.states()["llm"], CircuitState::HalfOpen);

    // Run 3: the trial succeeds and the circuit closes.
    let mut graph = TaskGraph::build(vec![remote_task("r5", "llm", &calls, 3)]).unwrap();
    let result = harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;
    assert!(!result.is_partial);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(harness.breakers.states()["llm"], CircuitState::Closed);
}

/// Test: A failed trial reopens the circuit
#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = SchedulerHarness::with(RetryPolicy::no_retry(), breaker_config());
    let breaker = harness.breakers.get_or_create("llm");
    for _ in 0..3 {
        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit);
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    let mut graph =
        TaskGraph::build(vec![remote_task("trial", "llm", &calls, u32::MAX)]).unwrap();
    harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::Open);
}

/// Test: Breakers are per service
/// Given an open breaker for one service
/// When tasks on two services run
/// Then only tasks on the broken service are rejected
#[tokio::test(start_paused = true)]
async fn test_breakers_isolated_per_service() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = SchedulerHarness::with(RetryPolicy::no_retry(), breaker_config());
    let broken = harness.breakers.get_or_create("llm");
    for _ in 0..3 {
        let permit = broken.try_acquire().unwrap();
        broken.record_failure(permit);
    }

    let mut graph = TaskGraph::build(vec![
        remote_task("ask", "llm", &calls, 0),
        remote_task("lookup", "search", &calls, 0),
    ])
    .unwrap();
    let result = harness.scheduler.execute_all(&mut graph, 2, DEADLINE).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        result.failure_for(&TaskId::new("ask")).unwrap().error_kind,
        ErrorKind::CircuitOpen
    );
    assert!(result.succeeded.get("lookup").is_some());
    assert_eq!(harness.breakers.states()["search"], CircuitState::Closed);
}

/// Test: Local tasks bypass breakers entirely
#[tokio::test(start_paused = true)]
async fn test_local_tasks_create_no_breaker() {
    let mut graph = TaskGraph::build(vec![Task::local(
        "compute",
        from_fn(|_ctx| async { Ok(json!(42)) }),
    )])
    .unwrap();
    let harness = SchedulerHarness::new();

    harness.scheduler.execute_all(&mut graph, 1, DEADLINE).await;

    assert!(harness.breakers.is_empty());
}
