//! Canonical error and result types for the crate.
//!
//! `PubSubError` is the single error surface returned by the
//! [`PubSub`](crate::pubsub::PubSub) operations. Failures raised inside a
//! listener callback never reach this type; they are reported as
//! [`ListenerError`] through logging instead.

use std::time::Duration;

use thiserror::Error;

use crate::{broker::BrokerError, codec::CodecError, panic::PanicMessage, pubsub::SubscriptionId};

/// Errors returned by adapter operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The broker could not be reached, refused the consumer, or rejected a
    /// publish. The adapter never retries these.
    #[error("broker unavailable for channel `{channel}`: {source}")]
    BrokerUnavailable {
        /// Channel the failing operation targeted.
        channel: String,
        /// Failure reported by the broker client.
        #[source]
        source: BrokerError,
    },
    /// The broker consumer did not report readiness in time.
    #[error("consumer for channel `{channel}` not ready after {timeout:?}")]
    ReadyTimeout {
        /// Channel whose consumer was being started.
        channel: String,
        /// Configured readiness timeout.
        timeout: Duration,
    },
    /// A second `next()` was issued on a cursor while one was still pending.
    #[error("cursor on channel `{channel}` already has a pending pull")]
    ConcurrentPull {
        /// Channel the cursor reads from.
        channel: String,
    },
    /// A payload could not be encoded for publishing.
    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),
    /// The adapter has been closed.
    #[error("pubsub adapter is closed")]
    Closed,
}

impl PubSubError {
    pub(crate) fn unavailable(channel: &str, source: BrokerError) -> Self {
        Self::BrokerUnavailable {
            channel: channel.to_owned(),
            source,
        }
    }

    /// Returns true if the error reflects broker connectivity rather than
    /// caller misuse.
    #[must_use]
    pub fn is_broker_failure(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable { .. } | Self::ReadyTimeout { .. }
        )
    }
}

/// A registered callback panicked while handling a message.
///
/// Only ever logged; delivery to other listeners continues.
#[derive(Debug, Error)]
#[error("listener {subscription} on channel `{channel}` panicked: {panic}")]
pub struct ListenerError {
    /// Channel being delivered when the callback failed.
    pub channel: String,
    /// Registration whose callback failed.
    pub subscription: SubscriptionId,
    /// Formatted panic payload.
    pub panic: PanicMessage,
}

/// Canonical result alias used by the public adapter API.
pub type Result<T> = std::result::Result<T, PubSubError>;
