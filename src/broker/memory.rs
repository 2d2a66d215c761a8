//! In-process broker implementing [`BrokerClient`].
//!
//! Each topic keeps a monotonically increasing offset and the set of started
//! consumers. Producing a record assigns the next offset and hands a copy to
//! every started consumer of the topic while the topic entry is locked, so
//! consumers observe records in offset order. Consumers start at the tail;
//! there is no retention or replay.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Ack, AckPolicy, BrokerClient, BrokerConfig, BrokerConsumer, BrokerError, BrokerRecord};

#[derive(Default)]
struct TopicState {
    next_offset: u64,
    consumers: HashMap<u64, mpsc::UnboundedSender<BrokerRecord>>,
}

#[derive(Default)]
struct BrokerState {
    connected: AtomicBool,
    shut_down: AtomicBool,
    next_consumer: AtomicU64,
    topics: DashMap<String, TopicState>,
}

impl BrokerState {
    fn check(&self) -> Result<(), BrokerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }

    fn detach(&self, topic: &str, id: u64) {
        if let Some(mut state) = self.topics.get_mut(topic) {
            state.consumers.remove(&id);
        }
    }
}

/// Cloneable handle to an in-process broker.
///
/// Clones share the same topics, so one clone can be handed to the adapter
/// while another is kept for inspection.
///
/// ```
/// use broker_pubsub::broker::MemoryBroker;
///
/// let broker = MemoryBroker::new();
/// assert_eq!(broker.consumer_count("orders"), 0);
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create an empty broker. Clients must still call `connect`.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Number of started consumers currently attached to `topic`.
    #[must_use]
    pub fn consumer_count(&self, topic: &str) -> usize {
        self.state
            .topics
            .get(topic)
            .map_or(0, |state| state.consumers.len())
    }

    /// Number of records produced to `topic` so far.
    #[must_use]
    pub fn produced(&self, topic: &str) -> u64 {
        self.state
            .topics
            .get(topic)
            .map_or(0, |state| state.next_offset)
    }

    /// Returns true once [`connect`](BrokerClient::connect) has succeeded.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.state.connected.load(Ordering::Acquire) }

    /// End every consumer stream and reject further operations.
    pub fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::Release);
        for mut topic in self.state.topics.iter_mut() {
            topic.consumers.clear();
        }
        debug!("memory broker shut down");
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self, config: &BrokerConfig) -> Result<(), BrokerError> {
        if self.state.shut_down.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        self.state.connected.store(true, Ordering::Release);
        debug!(endpoint = %config.endpoint(), security = %config.security, "memory broker connected");
        Ok(())
    }

    async fn produce(&self, mut record: BrokerRecord, acks: AckPolicy) -> Result<Ack, BrokerError> {
        self.state.check()?;
        let mut topic = self.state.topics.entry(record.topic.clone()).or_default();
        let offset = topic.next_offset;
        topic.next_offset += 1;
        record.offset = Some(offset);
        topic
            .consumers
            .retain(|_, tx| tx.send(record.clone()).is_ok());
        trace!(topic = %record.topic, offset, ?acks, "record produced");
        Ok(Ack {
            topic: record.topic,
            offset,
        })
    }

    async fn consumer(&self, topic: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.state.check()?;
        let id = self.state.next_consumer.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConsumer {
            id,
            topic: topic.to_owned(),
            state: Arc::clone(&self.state),
            rx: None,
        }))
    }
}

/// Consumer created by [`MemoryBroker`].
struct MemoryConsumer {
    id: u64,
    topic: String,
    state: Arc<BrokerState>,
    rx: Option<mpsc::UnboundedReceiver<BrokerRecord>>,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn start(&mut self) -> Result<(), BrokerError> {
        self.state.check()?;
        if self.rx.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .topics
            .entry(self.topic.clone())
            .or_default()
            .consumers
            .insert(self.id, tx);
        self.rx = Some(rx);
        debug!(topic = %self.topic, consumer = self.id, "memory consumer started");
        Ok(())
    }

    async fn next_record(&mut self) -> Option<Result<BrokerRecord, BrokerError>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await.map(Ok),
            None => Some(Err(BrokerError::Consumer {
                topic: self.topic.clone(),
                reason: "consumer not started".to_owned(),
            })),
        }
    }

    async fn stop(&mut self) -> Result<(), BrokerError> {
        self.state.detach(&self.topic, self.id);
        if self.rx.take().is_some() {
            debug!(topic = %self.topic, consumer = self.id, "memory consumer stopped");
        }
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) { self.state.detach(&self.topic, self.id); }
}
