//! Metric helpers for `broker_pubsub`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking channels with a live broker consumer.
pub const CHANNELS_ACTIVE: &str = "broker_pubsub_channels_active";
/// Name of the counter tracking acknowledged publishes.
pub const MESSAGES_PUBLISHED: &str = "broker_pubsub_messages_published_total";
/// Name of the counter tracking per-listener deliveries.
pub const MESSAGES_DELIVERED: &str = "broker_pubsub_messages_delivered_total";
/// Name of the counter tracking panicking listener callbacks.
pub const LISTENER_ERRORS: &str = "broker_pubsub_listener_errors_total";
/// Name of the counter tracking inbound records that could not be decoded.
pub const DECODE_ERRORS: &str = "broker_pubsub_decode_errors_total";

/// Kind of listener a payload was delivered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A callback registered with `subscribe`.
    Callback,
    /// A pull cursor opened with `async_iterator`.
    Cursor,
}

impl Delivery {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Delivery::Callback => "callback",
            Delivery::Cursor => "cursor",
        }
    }
}

/// Increment the active channels gauge.
pub fn inc_channels() {
    #[cfg(feature = "metrics")]
    gauge!(CHANNELS_ACTIVE).increment(1.0);
}

/// Decrement the active channels gauge.
pub fn dec_channels() {
    #[cfg(feature = "metrics")]
    gauge!(CHANNELS_ACTIVE).decrement(1.0);
}

/// Record an acknowledged publish.
pub fn inc_published() {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_PUBLISHED).increment(1);
}

/// Record a delivery to one listener.
pub fn inc_delivered(delivery: Delivery) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_DELIVERED, "sink" => delivery.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = delivery;
}

/// Record a panicking listener callback.
pub fn inc_listener_errors() {
    #[cfg(feature = "metrics")]
    counter!(LISTENER_ERRORS).increment(1);
}

/// Record an inbound record that could not be unframed or decoded.
pub fn inc_decode_errors() {
    #[cfg(feature = "metrics")]
    counter!(DECODE_ERRORS).increment(1);
}
