//! Payload encoding and record framing.
//!
//! A [`PayloadCodec`] turns typed payloads into bytes. [`Framing`] decides how
//! the channel name travels with those bytes, and [`TopicStrategy`] maps a
//! channel onto a broker topic. When several channels share one topic the
//! framed channel name is what routes a record to the right consumer.

use bincode::{
    config,
    error::{DecodeError, EncodeError},
};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::broker::BrokerRecord;

/// Record header carrying the channel under [`Framing::Headers`].
pub const CHANNEL_HEADER: &str = "channel";

/// Values that can be published through the adapter.
///
/// Blanket-implemented for every cloneable, thread-safe `serde` type.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Errors raised while encoding or decoding payloads and frames.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] EncodeError),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] DecodeError),
    #[error("record is missing the `{0}` header")]
    MissingHeader(&'static str),
    #[error("channel header is not valid UTF-8")]
    InvalidChannel,
}

/// Pluggable payload serialization.
///
/// The methods are generic over the payload, so the trait is used as a type
/// parameter rather than a trait object.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Serialize `payload` into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the value cannot be serialized.
    fn encode<P: Serialize>(&self, payload: &P) -> Result<Bytes, CodecError>;

    /// Deserialize a payload from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes do not describe a `P`.
    fn decode<P: DeserializeOwned>(&self, bytes: &[u8]) -> Result<P, CodecError>;
}

/// Codec using `bincode`'s serde integration with its standard configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl PayloadCodec for BincodeCodec {
    fn encode<P: Serialize>(&self, payload: &P) -> Result<Bytes, CodecError> {
        let bytes = bincode::serde::encode_to_vec(payload, config::standard())?;
        Ok(Bytes::from(bytes))
    }

    fn decode<P: DeserializeOwned>(&self, bytes: &[u8]) -> Result<P, CodecError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, config::standard())?;
        Ok(value)
    }
}

/// How channels map onto broker topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicStrategy {
    /// One topic per channel, named `prefix` followed by the channel.
    PerChannel { prefix: String },
    /// Every channel shares `topic`; records are told apart by their framing.
    Shared { topic: String },
}

impl Default for TopicStrategy {
    fn default() -> Self {
        Self::PerChannel {
            prefix: String::new(),
        }
    }
}

impl TopicStrategy {
    /// Broker topic backing `channel`.
    ///
    /// ```
    /// use broker_pubsub::codec::TopicStrategy;
    ///
    /// let per_channel = TopicStrategy::PerChannel { prefix: "app.".into() };
    /// assert_eq!(per_channel.topic_for("orders"), "app.orders");
    ///
    /// let shared = TopicStrategy::Shared { topic: "events".into() };
    /// assert_eq!(shared.topic_for("orders"), "events");
    /// ```
    #[must_use]
    pub fn topic_for(&self, channel: &str) -> String {
        match self {
            Self::PerChannel { prefix } => format!("{prefix}{channel}"),
            Self::Shared { topic } => topic.clone(),
        }
    }
}

/// Where the channel name is stored on a record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    /// Channel and body are encoded together in the record payload.
    #[default]
    Envelope,
    /// Channel travels in the [`CHANNEL_HEADER`] header; the payload is the
    /// bare body.
    Headers,
}

#[derive(bincode::Encode, bincode::Decode)]
struct Envelope {
    channel: String,
    body: Vec<u8>,
}

/// Frames bodies into records and back according to the configured strategy.
#[derive(Clone, Debug, Default)]
pub(crate) struct Framer {
    pub(crate) topics: TopicStrategy,
    pub(crate) framing: Framing,
}

impl Framer {
    pub(crate) fn new(topics: TopicStrategy, framing: Framing) -> Self { Self { topics, framing } }

    pub(crate) fn topic_for(&self, channel: &str) -> String { self.topics.topic_for(channel) }

    pub(crate) fn frame(&self, channel: &str, body: Bytes) -> Result<BrokerRecord, CodecError> {
        let topic = self.topic_for(channel);
        match self.framing {
            Framing::Envelope => {
                let envelope = Envelope {
                    channel: channel.to_owned(),
                    body: body.to_vec(),
                };
                let bytes = bincode::encode_to_vec(&envelope, config::standard())?;
                Ok(BrokerRecord::new(topic, Bytes::from(bytes)))
            }
            Framing::Headers => Ok(BrokerRecord::new(topic, body)
                .with_header(CHANNEL_HEADER, Bytes::copy_from_slice(channel.as_bytes()))),
        }
    }

    /// Split a record into its channel and body.
    pub(crate) fn unframe(&self, record: &BrokerRecord) -> Result<(String, Bytes), CodecError> {
        match self.framing {
            Framing::Envelope => {
                let (envelope, _): (Envelope, usize) =
                    bincode::decode_from_slice(&record.payload, config::standard())?;
                Ok((envelope.channel, Bytes::from(envelope.body)))
            }
            Framing::Headers => {
                let raw = record
                    .header(CHANNEL_HEADER)
                    .ok_or(CodecError::MissingHeader(CHANNEL_HEADER))?;
                let channel = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidChannel)?;
                Ok((channel.to_owned(), record.payload.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Probe {
        id: String,
    }

    #[test]
    fn bincode_codec_preserves_structured_payloads() {
        let probe = Probe { id: "subscribe-value".into() };
        let bytes = BincodeCodec.encode(&probe).expect("encode");
        let decoded: Probe = BincodeCodec.decode(&bytes).expect("decode");
        assert_eq!(decoded, probe);
    }

    #[test]
    fn bincode_codec_rejects_truncated_input() {
        let result: Result<Probe, _> = BincodeCodec.decode(&[]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[rstest]
    #[case::envelope(Framing::Envelope)]
    #[case::headers(Framing::Headers)]
    fn unframe_recovers_channel_and_body(#[case] framing: Framing) {
        let framer = Framer::new(TopicStrategy::Shared { topic: "events".into() }, framing);
        let record = framer
            .frame("orders", Bytes::from_static(b"body"))
            .expect("frame");
        assert_eq!(record.topic, "events");

        let (channel, body) = framer.unframe(&record).expect("unframe");
        assert_eq!(channel, "orders");
        assert_eq!(body, Bytes::from_static(b"body"));
    }

    #[test]
    fn header_framing_keeps_body_as_payload() {
        let framer = Framer::new(TopicStrategy::default(), Framing::Headers);
        let record = framer
            .frame("orders", Bytes::from_static(b"body"))
            .expect("frame");
        assert_eq!(record.topic, "orders");
        assert_eq!(record.payload, Bytes::from_static(b"body"));
        assert_eq!(
            record.header(CHANNEL_HEADER),
            Some(&Bytes::from_static(b"orders"))
        );
    }

    #[test]
    fn header_framing_requires_channel_header() {
        let framer = Framer::new(TopicStrategy::default(), Framing::Headers);
        let record = BrokerRecord::new("orders", Bytes::from_static(b"body"));
        assert!(matches!(
            framer.unframe(&record),
            Err(CodecError::MissingHeader(CHANNEL_HEADER))
        ));
    }

    #[test]
    fn header_framing_rejects_non_utf8_channel() {
        let framer = Framer::new(TopicStrategy::default(), Framing::Headers);
        let record = BrokerRecord::new("orders", Bytes::from_static(b"body"))
            .with_header(CHANNEL_HEADER, Bytes::from_static(&[0xff, 0xfe]));
        assert!(matches!(
            framer.unframe(&record),
            Err(CodecError::InvalidChannel)
        ));
    }
}
