//! Shared utilities for integration tests.
//!
//! Provides fixtures for adapters over the in-process and fault-injecting
//! brokers.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::time::Duration;

use broker_pubsub::{MemoryBroker, PubSub, PubSubConfig};
use broker_pubsub_testing::{FaultyBroker, Probe};
use rstest::fixture;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Ready timeout short enough to keep timeout tests fast.
pub const SHORT_READY_TIMEOUT: Duration = Duration::from_millis(50);

/// In-process broker shared between the adapter and the test.
#[expect(
    unused_braces,
    reason = "rustc false positive for single-line rstest fixtures"
)]
#[fixture]
pub fn broker() -> MemoryBroker { MemoryBroker::new() }

/// Fault-injecting broker shared between the adapter and the test.
#[expect(
    unused_braces,
    reason = "rustc false positive for single-line rstest fixtures"
)]
#[fixture]
pub fn faulty() -> FaultyBroker { FaultyBroker::new() }

/// Adapter over `broker` with the default configuration.
pub fn pubsub_over(broker: &MemoryBroker) -> PubSub<Probe> {
    PubSub::new(broker.clone(), PubSubConfig::default())
}

/// Adapter over `broker` that gives up on consumer readiness quickly.
#[expect(
    clippy::expect_used,
    reason = "a fixed valid configuration must abort the test if rejected"
)]
pub fn impatient_pubsub(broker: &FaultyBroker) -> PubSub<Probe, FaultyBroker> {
    let config = PubSubConfig::builder()
        .ready_timeout(SHORT_READY_TIMEOUT)
        .build()
        .expect("valid config");
    PubSub::new(broker.clone(), config)
}

/// Let spawned channel tasks run until they park.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
