#![doc(html_root_url = "https://docs.rs/broker_pubsub/latest")]
//! Public API for the `broker_pubsub` library.
//!
//! This crate provides a publish/subscribe adapter that fronts a topic-based
//! message broker. One broker consumer per channel is multiplexed across any
//! number of callback subscriptions and pull cursors, and every registration
//! receives every message published after it resolved.

pub mod backoff;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod panic;
pub mod pubsub;

pub use broker::{BrokerClient, BrokerConsumer, BrokerError, MemoryBroker};
pub use codec::{BincodeCodec, Framing, Payload, PayloadCodec, TopicStrategy};
pub use config::{ConfigError, PubSubConfig};
/// Result type alias re-exported for convenience when calling adapter
/// operations.
pub use error::Result;
pub use error::{ListenerError, PubSubError};
pub use pubsub::{ChannelCursor, ChannelState, PubSub, SubscriptionId};
