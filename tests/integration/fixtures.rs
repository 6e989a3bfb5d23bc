//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Instrumented executors that record start/finish order and peak concurrency
//! - A scheduler harness with an attached event channel
//! - Predefined graph shapes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use conductor::core::{from_fn, Task, TaskError};
use conductor::orchestration::{Scheduler, SchedulerEvent};
use conductor::progress::ProgressPublisher;
use conductor::resilience::{BreakerConfig, CircuitBreakerRegistry, RetryPolicy};

/// Shared record of what instrumented tasks did.
#[derive(Debug, Default)]
pub struct Tracker {
    running: AtomicUsize,
    peak: AtomicUsize,
    starts: Mutex<Vec<String>>,
    finishes: Mutex<Vec<String>>,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of instrumented tasks seen running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    pub fn finishes(&self) -> Vec<String> {
        self.finishes.lock().unwrap().clone()
    }

    /// Position of `id` in the start order.
    pub fn started_at(&self, id: &str) -> usize {
        self.starts()
            .iter()
            .position(|s| s == id)
            .unwrap_or_else(|| panic!("{} never started", id))
    }

    /// Position of `id` in the finish order.
    pub fn finished_at(&self, id: &str) -> usize {
        self.finishes()
            .iter()
            .position(|s| s == id)
            .unwrap_or_else(|| panic!("{} never finished", id))
    }

    fn enter(&self, id: &str) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.starts.lock().unwrap().push(id.to_string());
    }

    fn exit(&self, id: &str) {
        self.finishes.lock().unwrap().push(id.to_string());
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A local task that sleeps for `work`, records itself in `tracker`, and
/// returns its own id.
pub fn tracked_task(id: &str, tracker: &Arc<Tracker>, work: Duration) -> Task {
    let tracker = Arc::clone(tracker);
    let name = id.to_string();
    Task::local(
        id,
        from_fn(move |_ctx| {
            let tracker = Arc::clone(&tracker);
            let name = name.clone();
            async move {
                tracker.enter(&name);
                tokio::time::sleep(work).await;
                tracker.exit(&name);
                Ok(json!(name))
            }
        }),
    )
}

/// A local task that fails every attempt with `error`.
pub fn failing_task(id: &str, error: TaskError) -> Task {
    Task::local(
        id,
        from_fn(move |_ctx| {
            let error = error.clone();
            async move { Err(error) }
        }),
    )
}

/// `count` independent tracker tasks named `t0`, `t1`, ...
pub fn independent_tasks(count: usize, tracker: &Arc<Tracker>, work: Duration) -> Vec<Task> {
    (0..count)
        .map(|i| tracked_task(&format!("t{}", i), tracker, work))
        .collect()
}

/// a -> {b, c} -> d
pub fn diamond(tracker: &Arc<Tracker>, work: Duration) -> Vec<Task> {
    vec![
        tracked_task("a", tracker, work),
        tracked_task("b", tracker, work).depends_on("a"),
        tracked_task("c", tracker, work).depends_on("a"),
        tracked_task("d", tracker, work).depends_on("b").depends_on("c"),
    ]
}

/// Retry policy with no jitter so delays are predictable.
pub fn fast_retry(attempt_limit: u32) -> RetryPolicy {
    RetryPolicy::new(attempt_limit, Duration::from_millis(10)).with_jitter(0.0)
}

/// Scheduler plus the receiving end of its event channel.
pub struct SchedulerHarness {
    pub scheduler: Scheduler,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub event_rx: mpsc::Receiver<SchedulerEvent>,
}

impl SchedulerHarness {
    pub fn new() -> Self {
        Self::with(fast_retry(3), BreakerConfig::default())
    }

    pub fn with(retry: RetryPolicy, breaker: BreakerConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(breaker));
        let publisher = ProgressPublisher::new(1024);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let scheduler = Scheduler::new(retry, Arc::clone(&breakers), publisher)
            .with_events(event_tx);
        Self {
            scheduler,
            breakers,
            event_rx,
        }
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}
