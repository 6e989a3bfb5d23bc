//! Progress reporting: weighted aggregation and subscriber fan-out.

pub mod aggregator;
pub mod publisher;

pub use aggregator::{
    ProgressAggregator, ProgressConfig, ProgressSnapshot, ProgressStatus, StageProgress,
};
pub use publisher::{ProgressPublisher, ProgressSubscription};
