//! Utilities for exercising a [`PubSub`](broker_pubsub::PubSub) adapter in
//! tests.
//!
//! [`FaultyBroker`] wraps the in-process broker with switchable failures and a
//! readiness delay, [`Probe`] is a small structured payload, and the macros
//! turn cursor pulls into assertions with file and line context.
//!
//! ```rust
//! use broker_pubsub::{PubSub, PubSubConfig};
//! use broker_pubsub_testing::{FaultyBroker, Probe};
//!
//! # async fn example() {
//! let broker = FaultyBroker::new();
//! let pubsub: PubSub<Probe, FaultyBroker> = PubSub::new(broker.clone(), PubSubConfig::default());
//! broker.fail_produce(true);
//! assert!(pubsub.publish("c", &Probe::new("x")).await.is_err());
//! # }
//! ```

pub mod broker;
pub mod logging;
pub mod macros;

use serde::{Deserialize, Serialize};

pub use broker::FaultyBroker;
pub use logging::{LoggerHandle, logger};

/// Structured payload used throughout the test suites.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub id: String,
}

impl Probe {
    /// Create a probe with the given identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self { Self { id: id.into() } }
}
