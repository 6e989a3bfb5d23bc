//! Integration test suite for conductor.
//!
//! These tests drive whole runs through the public API: graph
//! construction, the scheduler, breakers and retries, progress
//! publication and result aggregation working together.
//!
//! # Test Categories
//!
//! - `scheduling`: Dependency order, concurrency bound, failure propagation
//! - `resilience`: Retry and circuit breaker behaviour across tasks
//! - `progress`: Snapshot stream seen by subscribers
//! - `manifest_runs`: End-to-end runs of TOML manifests
//!
//! # CI Compatibility
//!
//! Executors are in-process closures or simulations; nothing touches the
//! network, and time-sensitive tests run on a paused clock.

mod fixtures;

mod progress;
mod resilience;
mod scheduling;
