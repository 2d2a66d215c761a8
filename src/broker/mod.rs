//! Broker-client collaborator contract.
//!
//! The multiplexer depends only on these traits. Partitioning, offsets and
//! security handshakes are the client's concern. [`MemoryBroker`] provides an
//! in-process implementation.
//!
//! ```text
//!   BrokerClient              -- one per adapter, shared
//!        │ creates
//!        ▼
//!   BrokerConsumer            -- one per active channel, owned by its task
//! ```

use std::{collections::BTreeMap, fmt, str::FromStr};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryBroker;

/// Errors reported by a broker client.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection to the broker could not be established.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect {
        /// Endpoint the client attempted to reach.
        endpoint: String,
        /// Failure details.
        reason: String,
    },
    /// The broker refused the record.
    #[error("record rejected by topic `{topic}`: {reason}")]
    Rejected {
        /// Topic the record was produced to.
        topic: String,
        /// Failure details.
        reason: String,
    },
    /// An operation was attempted before `connect`.
    #[error("broker client is not connected")]
    NotConnected,
    /// The consumer could not be created, started or polled.
    #[error("consumer error on topic `{topic}`: {reason}")]
    Consumer {
        /// Topic the consumer reads.
        topic: String,
        /// Failure details.
        reason: String,
    },
    /// The broker has been shut down.
    #[error("broker is shut down")]
    Closed,
}

/// Acknowledgement requirement applied to produced records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Do not wait for any acknowledgement beyond the local hand-off.
    None,
    /// Wait for the partition leader.
    #[default]
    Leader,
    /// Wait for every in-sync replica.
    All,
}

/// Transport security selected for the broker connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    /// Canonical configuration spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }
}

impl fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Returned when a security protocol name is not recognised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown security protocol `{0}`")]
pub struct UnknownSecurityProtocol(pub String);

impl FromStr for SecurityProtocol {
    type Err = UnknownSecurityProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(UnknownSecurityProtocol(s.to_owned())),
        }
    }
}

/// Connection settings handed to [`BrokerClient::connect`].
///
/// `properties` carries client-specific settings verbatim; the adapter never
/// interprets them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityProtocol,
    pub properties: BTreeMap<String, String>,
}

impl BrokerConfig {
    /// `host:port` form of the endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String { format!("{}:{}", self.host, self.port) }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 9092,
            security: SecurityProtocol::default(),
            properties: BTreeMap::new(),
        }
    }
}

/// A record as seen by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub headers: Vec<(String, Bytes)>,
    pub payload: Bytes,
    /// Assigned by the broker; `None` on records not yet produced.
    pub offset: Option<u64>,
}

impl BrokerRecord {
    /// Create an unproduced record without headers.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            headers: Vec::new(),
            payload,
            offset: None,
        }
    }

    /// Attach a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Look up the first header named `key`.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Broker acknowledgement of a produced record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub topic: String,
    pub offset: u64,
}

/// Client for a topic-based broker.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Establish the connection. Called once before any other operation.
    async fn connect(&self, config: &BrokerConfig) -> Result<(), BrokerError>;

    /// Produce `record`, resolving when the broker satisfies `acks`.
    async fn produce(&self, record: BrokerRecord, acks: AckPolicy) -> Result<Ack, BrokerError>;

    /// Create an unstarted consumer for `topic`.
    async fn consumer(&self, topic: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

/// A consumer bound to one topic.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Begin consuming. Resolves once every record produced afterwards is
    /// guaranteed to be observed.
    async fn start(&mut self) -> Result<(), BrokerError>;

    /// Next record, or `None` once the broker ends the stream.
    ///
    /// Must be cancel-safe: the adapter drops this future when the channel is
    /// torn down.
    async fn next_record(&mut self) -> Option<Result<BrokerRecord, BrokerError>>;

    /// Release broker resources.
    async fn stop(&mut self) -> Result<(), BrokerError>;
}
