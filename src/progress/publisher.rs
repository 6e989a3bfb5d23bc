//! Push-based delivery of progress snapshots to subscribers.
//!
//! Each subscriber gets a bounded queue. A subscriber that falls behind
//! loses its oldest queued snapshots, never the newest, so what it does
//! receive is still in order and always ends with the final snapshot.
//! Subscribers that reconnect can ask for [`ProgressPublisher::latest`].

use tokio::sync::{broadcast, watch};

use crate::progress::aggregator::ProgressSnapshot;

/// Handle the scheduler publishes through; cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressPublisher {
    tx: broadcast::Sender<ProgressSnapshot>,
    latest: watch::Sender<Option<ProgressSnapshot>>,
}

impl ProgressPublisher {
    /// Create a publisher whose subscribers buffer up to `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (latest, _) = watch::channel(None);
        Self { tx, latest }
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            rx: self.tx.subscribe(),
            missed: 0,
        }
    }

    /// Push a snapshot to every current subscriber.
    ///
    /// Returns how many subscribers it was queued for.
    pub fn publish(&self, snapshot: ProgressSnapshot) -> usize {
        self.latest.send_replace(Some(snapshot.clone()));
        // No subscribers is not an error; the snapshot stays available as latest.
        self.tx.send(snapshot).unwrap_or(0)
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(64)
    }
}

/// One subscriber's view of the snapshot stream.
#[derive(Debug)]
pub struct ProgressSubscription {
    rx: broadcast::Receiver<ProgressSnapshot>,
    missed: u64,
}

impl ProgressSubscription {
    /// Next snapshot, or `None` once every publisher handle is dropped.
    pub async fn recv(&mut self) -> Option<ProgressSnapshot> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress subscriber lagged");
                    self.missed += skipped;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued snapshot without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressSnapshot> {
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                }
                Err(_) => return None,
            }
        }
    }

    /// Snapshots dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
