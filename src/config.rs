//! Adapter configuration.
//!
//! [`PubSubConfig`] bundles the topic mapping, framing, acknowledgement policy
//! and timing knobs used by [`PubSub`](crate::pubsub::PubSub), plus the
//! [`BrokerConfig`] passed through untouched to the broker client. Build one
//! with [`PubSubConfig::builder`] or load it from the environment with
//! [`PubSubConfig::from_env`].

use std::{collections::BTreeMap, env, time::Duration};

use thiserror::Error;

use crate::{
    backoff::BackoffConfig,
    broker::{AckPolicy, BrokerConfig, SecurityProtocol, UnknownSecurityProtocol},
    codec::{Framing, TopicStrategy},
};

/// Highest supported rate for [`PubSubConfigBuilder::publish_rate`].
pub const MAX_PUBLISH_RATE: usize = 10_000;
/// Readiness timeout applied when none is configured.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable naming the shared topic.
pub const ENV_TOPIC: &str = "BROKER_TOPIC";
/// Environment variable naming the broker host.
pub const ENV_HOST: &str = "BROKER_HOST";
/// Environment variable naming the broker port.
pub const ENV_PORT: &str = "BROKER_PORT";
/// Environment variable naming the security protocol.
pub const ENV_SECURITY: &str = "BROKER_SECURITY";

/// Errors returned when building a configuration.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The publish rate was zero or exceeded [`MAX_PUBLISH_RATE`].
    #[error("invalid publish rate {0}; must be between 1 and {max}", max = MAX_PUBLISH_RATE)]
    InvalidRate(usize),
    /// The readiness timeout was zero.
    #[error("ready timeout must be greater than zero")]
    InvalidTimeout,
    /// A shared topic strategy named an empty topic.
    #[error("shared topic name must not be empty")]
    EmptyTopic,
    /// An environment variable held an unparsable port.
    #[error("invalid port `{value}` in {var}")]
    InvalidPort {
        /// Variable that was read.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// An environment variable named an unknown security protocol.
    #[error(transparent)]
    Security(#[from] UnknownSecurityProtocol),
}

/// Validated adapter configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubConfig {
    pub(crate) topics: TopicStrategy,
    pub(crate) framing: Framing,
    pub(crate) acks: AckPolicy,
    pub(crate) ready_timeout: Duration,
    pub(crate) publish_rate: Option<usize>,
    pub(crate) consumer_backoff: BackoffConfig,
    pub(crate) broker: BrokerConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            topics: TopicStrategy::default(),
            framing: Framing::default(),
            acks: AckPolicy::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            publish_rate: None,
            consumer_backoff: BackoffConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl PubSubConfig {
    /// Start building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> PubSubConfigBuilder { PubSubConfigBuilder::default() }

    /// Load settings from `BROKER_TOPIC`, `BROKER_HOST`, `BROKER_PORT` and
    /// `BROKER_SECURITY`.
    ///
    /// Unset variables fall back to a shared topic named `test` on
    /// `localhost:9092` over `PLAINTEXT`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPort`] or [`ConfigError::Security`] for
    /// unparsable values, and any validation error from
    /// [`PubSubConfigBuilder::build`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let topic = env::var(ENV_TOPIC).unwrap_or_else(|_| "test".to_owned());
        let host = env::var(ENV_HOST).unwrap_or_else(|_| "localhost".to_owned());
        let port = match env::var(ENV_PORT) {
            Ok(value) => value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort {
                var: ENV_PORT,
                value,
            })?,
            Err(_) => 9092,
        };
        let security = match env::var(ENV_SECURITY) {
            Ok(value) => value.parse::<SecurityProtocol>()?,
            Err(_) => SecurityProtocol::Plaintext,
        };
        Self::builder()
            .topics(TopicStrategy::Shared { topic })
            .broker(BrokerConfig {
                host,
                port,
                security,
                properties: BTreeMap::new(),
            })
            .build()
    }

    #[must_use]
    pub fn topics(&self) -> &TopicStrategy { &self.topics }

    #[must_use]
    pub fn framing(&self) -> Framing { self.framing }

    #[must_use]
    pub fn acks(&self) -> AckPolicy { self.acks }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration { self.ready_timeout }

    #[must_use]
    pub fn publish_rate(&self) -> Option<usize> { self.publish_rate }

    #[must_use]
    pub fn consumer_backoff(&self) -> BackoffConfig { self.consumer_backoff }

    #[must_use]
    pub fn broker(&self) -> &BrokerConfig { &self.broker }
}

/// Builder for [`PubSubConfig`].
///
/// ```
/// use std::time::Duration;
///
/// use broker_pubsub::{codec::Framing, config::PubSubConfig};
///
/// let config = PubSubConfig::builder()
///     .framing(Framing::Headers)
///     .ready_timeout(Duration::from_secs(2))
///     .publish_rate(Some(100))
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.framing(), Framing::Headers);
/// ```
#[derive(Debug, Default)]
pub struct PubSubConfigBuilder {
    config: PubSubConfig,
}

impl PubSubConfigBuilder {
    /// Choose how channels map onto broker topics.
    #[must_use]
    pub fn topics(mut self, topics: TopicStrategy) -> Self {
        self.config.topics = topics;
        self
    }

    /// Choose where the channel name travels on each record.
    #[must_use]
    pub fn framing(mut self, framing: Framing) -> Self {
        self.config.framing = framing;
        self
    }

    /// Acknowledgement the broker must give before `publish` resolves.
    #[must_use]
    pub fn acks(mut self, acks: AckPolicy) -> Self {
        self.config.acks = acks;
        self
    }

    /// How long a new channel consumer may take to become ready.
    #[must_use]
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Cap publishes per second. `None` disables throttling.
    #[must_use]
    pub fn publish_rate(mut self, rate: Option<usize>) -> Self {
        self.config.publish_rate = rate;
        self
    }

    /// Back-off between polls of a consumer that keeps reporting errors.
    /// Delays are normalised before use.
    #[must_use]
    pub fn consumer_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.consumer_backoff = backoff.normalized();
        self
    }

    /// Connection settings passed through to the broker client.
    #[must_use]
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.config.broker = broker;
        self
    }

    /// Add a client-specific property, such as `security.protocol` overrides.
    #[must_use]
    pub fn broker_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.broker.properties.insert(key.into(), value.into());
        self
    }

    /// Validate and produce the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRate`] if the publish rate is zero or
    /// greater than [`MAX_PUBLISH_RATE`], [`ConfigError::InvalidTimeout`] if
    /// the readiness timeout is zero and [`ConfigError::EmptyTopic`] if a
    /// shared topic has no name.
    pub fn build(self) -> Result<PubSubConfig, ConfigError> {
        let config = self.config;
        if let Some(rate) = config
            .publish_rate
            .filter(|&r| r == 0 || r > MAX_PUBLISH_RATE)
        {
            return Err(ConfigError::InvalidRate(rate));
        }
        if config.ready_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        if matches!(&config.topics, TopicStrategy::Shared { topic } if topic.is_empty()) {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::zero(0)]
    #[case::too_high(MAX_PUBLISH_RATE + 1)]
    fn builder_rejects_invalid_rate(#[case] rate: usize) {
        let result = PubSubConfig::builder().publish_rate(Some(rate)).build();
        assert_eq!(result, Err(ConfigError::InvalidRate(rate)));
    }

    #[test]
    fn builder_accepts_max_rate() {
        let config = PubSubConfig::builder()
            .publish_rate(Some(MAX_PUBLISH_RATE))
            .build()
            .expect("max rate is valid");
        assert_eq!(config.publish_rate(), Some(MAX_PUBLISH_RATE));
    }

    #[test]
    fn builder_rejects_zero_timeout() {
        let result = PubSubConfig::builder()
            .ready_timeout(Duration::ZERO)
            .build();
        assert_eq!(result, Err(ConfigError::InvalidTimeout));
    }

    #[test]
    fn builder_normalises_consumer_backoff() {
        let config = PubSubConfig::builder()
            .consumer_backoff(BackoffConfig {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(20),
            })
            .build()
            .expect("backoff is always accepted");
        let backoff = config.consumer_backoff();
        assert_eq!(backoff.initial_delay, Duration::from_millis(20));
        assert_eq!(backoff.max_delay, Duration::from_millis(50));
    }

    #[test]
    fn builder_rejects_empty_shared_topic() {
        let result = PubSubConfig::builder()
            .topics(TopicStrategy::Shared {
                topic: String::new(),
            })
            .build();
        assert_eq!(result, Err(ConfigError::EmptyTopic));
    }

    #[test]
    fn defaults_map_channels_one_to_one() {
        let config = PubSubConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.topics().topic_for("orders"), "orders");
        assert_eq!(config.framing(), Framing::Envelope);
        assert_eq!(config.acks(), AckPolicy::Leader);
        assert_eq!(config.ready_timeout(), DEFAULT_READY_TIMEOUT);
        assert_eq!(config.broker().endpoint(), "localhost:9092");
    }

    #[test]
    fn broker_properties_are_passed_through() {
        let config = PubSubConfig::builder()
            .broker_property("security.protocol", "SSL")
            .build()
            .expect("valid");
        assert_eq!(
            config.broker().properties.get("security.protocol").map(String::as_str),
            Some("SSL")
        );
    }
}
