//! Fault-injecting broker client.
//!
//! [`FaultyBroker`] delegates to a [`MemoryBroker`] and can be told to fail
//! individual operations or to delay consumer readiness. Switches take effect
//! for calls made after they are flipped.

use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use broker_pubsub::{
    BrokerClient,
    BrokerConsumer,
    BrokerError,
    MemoryBroker,
    broker::{Ack, AckPolicy, BrokerConfig, BrokerRecord},
};

#[derive(Default)]
struct Faults {
    connect: AtomicBool,
    produce: AtomicBool,
    consumer: AtomicBool,
    start: AtomicBool,
    records: AtomicBool,
    start_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    consumers: AtomicUsize,
    record_errors: AtomicUsize,
}

/// Cloneable [`BrokerClient`] with switchable failures.
#[derive(Clone, Default)]
pub struct FaultyBroker {
    inner: MemoryBroker,
    faults: Arc<Faults>,
}

impl FaultyBroker {
    /// Create a broker with every fault switched off.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Underlying in-process broker, for inspection.
    #[must_use]
    pub fn memory(&self) -> &MemoryBroker { &self.inner }

    /// Make `connect` fail.
    pub fn fail_connect(&self, fail: bool) { self.faults.connect.store(fail, Ordering::SeqCst); }

    /// Make `produce` reject records.
    pub fn fail_produce(&self, fail: bool) { self.faults.produce.store(fail, Ordering::SeqCst); }

    /// Make consumer creation fail.
    pub fn fail_consumer(&self, fail: bool) { self.faults.consumer.store(fail, Ordering::SeqCst); }

    /// Make consumer `start` fail.
    pub fn fail_start(&self, fail: bool) { self.faults.start.store(fail, Ordering::SeqCst); }

    /// Make consumers report an error instead of waiting for a record.
    pub fn fail_records(&self, fail: bool) { self.faults.records.store(fail, Ordering::SeqCst); }

    /// Delay consumer `start` by `delay` before delegating.
    pub fn delay_start(&self, delay: Option<Duration>) {
        *self
            .faults
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Number of `connect` calls observed.
    #[must_use]
    pub fn connect_calls(&self) -> usize { self.faults.connects.load(Ordering::SeqCst) }

    /// Number of consumers created.
    #[must_use]
    pub fn consumers_created(&self) -> usize { self.faults.consumers.load(Ordering::SeqCst) }

    /// Number of record errors handed out while `fail_records` was set.
    #[must_use]
    pub fn record_errors(&self) -> usize { self.faults.record_errors.load(Ordering::SeqCst) }
}

#[async_trait]
impl BrokerClient for FaultyBroker {
    async fn connect(&self, config: &BrokerConfig) -> Result<(), BrokerError> {
        self.faults.connects.fetch_add(1, Ordering::SeqCst);
        if self.faults.connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect {
                endpoint: config.endpoint(),
                reason: "injected connect failure".to_owned(),
            });
        }
        self.inner.connect(config).await
    }

    async fn produce(&self, record: BrokerRecord, acks: AckPolicy) -> Result<Ack, BrokerError> {
        if self.faults.produce.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected {
                topic: record.topic,
                reason: "injected produce failure".to_owned(),
            });
        }
        self.inner.produce(record, acks).await
    }

    async fn consumer(&self, topic: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        if self.faults.consumer.load(Ordering::SeqCst) {
            return Err(BrokerError::Consumer {
                topic: topic.to_owned(),
                reason: "injected consumer failure".to_owned(),
            });
        }
        let inner = self.inner.consumer(topic).await?;
        self.faults.consumers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FaultyConsumer {
            topic: topic.to_owned(),
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FaultyConsumer {
    topic: String,
    inner: Box<dyn BrokerConsumer>,
    faults: Arc<Faults>,
}

#[async_trait]
impl BrokerConsumer for FaultyConsumer {
    async fn start(&mut self) -> Result<(), BrokerError> {
        let delay = *self
            .faults
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.start.load(Ordering::SeqCst) {
            return Err(BrokerError::Consumer {
                topic: self.topic.clone(),
                reason: "injected start failure".to_owned(),
            });
        }
        self.inner.start().await
    }

    async fn next_record(&mut self) -> Option<Result<BrokerRecord, BrokerError>> {
        if self.faults.records.load(Ordering::SeqCst) {
            self.faults.record_errors.fetch_add(1, Ordering::SeqCst);
            return Some(Err(BrokerError::Consumer {
                topic: self.topic.clone(),
                reason: "injected record failure".to_owned(),
            }));
        }
        self.inner.next_record().await
    }

    async fn stop(&mut self) -> Result<(), BrokerError> { self.inner.stop().await }
}
