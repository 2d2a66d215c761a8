//! Channel multiplexer.
//!
//! [`PubSub`] is the single point of contact between application code and
//! the broker. It keeps at most one broker consumer per channel, however many
//! callbacks and cursors are registered on it, and fans every received record
//! out to all of them. Registration does not resolve until the channel's
//! consumer is ready, so a publish issued after `subscribe` or
//! `async_iterator` returns is always observed.
//!
//! Each active channel is served by a task on the adapter's
//! [`TaskTracker`]. The task owns the broker consumer, decodes each record
//! once and delivers it to a snapshot of the channel's listeners: callbacks
//! run in sequence on the task with panics caught and logged, cursors get the
//! payload queued. Cancelling the channel's token stops the consumer.

use std::{
    fmt,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use leaky_bucket::RateLimiter;
use tokio::{
    sync::OnceCell,
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    backoff::BackoffConfig,
    broker::{BrokerClient, BrokerConsumer, BrokerError, BrokerRecord, MemoryBroker},
    codec::{BincodeCodec, Framer, Payload, PayloadCodec},
    config::PubSubConfig,
    error::{PubSubError, Result},
    metrics,
};

mod cursor;
mod registry;

pub use cursor::ChannelCursor;
use cursor::CursorQueue;
use registry::{Activation, Claim, Registry, SinkKind, SinkSet};

/// Identifier of a callback subscription or pull cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl From<u64> for SubscriptionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl SubscriptionId {
    /// Create a new [`SubscriptionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

/// Consumption state of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// No broker consumer exists for the channel.
    Unconsumed,
    /// A first registration is waiting for the consumer to become ready.
    Starting,
    /// A ready consumer is feeding at least one registration.
    Active,
}

struct Shared<B, C> {
    client: B,
    codec: Arc<C>,
    framer: Arc<Framer>,
    config: PubSubConfig,
    connected: OnceCell<()>,
    limiter: Option<RateLimiter>,
    closed: AtomicBool,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl<B, C> Drop for Shared<B, C> {
    fn drop(&mut self) { self.root.cancel(); }
}

/// Publish/subscribe adapter multiplexing broker consumers per channel.
///
/// Cloning is cheap; clones share channels, registrations and the broker
/// client. Call [`close`](Self::close) to release broker resources; dropping
/// the last clone cancels the channel tasks without waiting for them.
///
/// ```
/// use broker_pubsub::{broker::MemoryBroker, config::PubSubConfig, pubsub::PubSub};
///
/// # async fn demo() -> broker_pubsub::Result<()> {
/// let pubsub: PubSub<String> = PubSub::new(MemoryBroker::new(), PubSubConfig::default());
/// let cursor = pubsub.async_iterator("greetings").await?;
/// pubsub.publish("greetings", &"hello".to_owned()).await?;
/// assert_eq!(cursor.next().await?, Some("hello".to_owned()));
/// pubsub.close().await;
/// # Ok(())
/// # }
/// ```
pub struct PubSub<P: Payload, B: BrokerClient = MemoryBroker, C: PayloadCodec = BincodeCodec> {
    shared: Arc<Shared<B, C>>,
    registry: Arc<Registry<P>>,
    _payload: PhantomData<fn(P)>,
}

impl<P: Payload, B: BrokerClient, C: PayloadCodec> Clone for PubSub<P, B, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            registry: Arc::clone(&self.registry),
            _payload: PhantomData,
        }
    }
}

impl<P: Payload, B: BrokerClient> PubSub<P, B, BincodeCodec> {
    /// Create an adapter using the default `bincode` payload codec.
    ///
    /// The broker connection is established lazily by the first operation.
    #[must_use]
    pub fn new(client: B, config: PubSubConfig) -> Self {
        Self::with_codec(client, BincodeCodec, config)
    }
}

impl<P: Payload, B: BrokerClient, C: PayloadCodec> PubSub<P, B, C> {
    /// Create an adapter with a custom payload codec.
    #[must_use]
    pub fn with_codec(client: B, codec: C, config: PubSubConfig) -> Self {
        let root = CancellationToken::new();
        let limiter = config.publish_rate.map(|rate| {
            RateLimiter::builder()
                .initial(rate)
                .refill(rate)
                .interval(Duration::from_secs(1))
                .max(rate)
                .build()
        });
        let framer = Framer::new(config.topics.clone(), config.framing);
        Self {
            shared: Arc::new(Shared {
                client,
                codec: Arc::new(codec),
                framer: Arc::new(framer),
                config,
                connected: OnceCell::new(),
                limiter,
                closed: AtomicBool::new(false),
                root: root.clone(),
                tracker: TaskTracker::new(),
            }),
            registry: Arc::new(Registry::new(root)),
            _payload: PhantomData,
        }
    }

    /// Configuration the adapter was built with.
    #[must_use]
    pub fn config(&self) -> &PubSubConfig { &self.shared.config }

    /// Publish `payload` on `channel`.
    ///
    /// Resolves once the broker acknowledges the record according to the
    /// configured [`AckPolicy`](crate::broker::AckPolicy). Failed publishes
    /// are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Closed`] after [`close`](Self::close),
    /// [`PubSubError::Codec`] if the payload cannot be encoded and
    /// [`PubSubError::BrokerUnavailable`] if the broker cannot be reached or
    /// rejects the record.
    pub async fn publish(&self, channel: &str, payload: &P) -> Result<()> {
        self.ensure_open()?;
        self.ensure_connected(channel).await?;
        let body = self.shared.codec.encode(payload)?;
        let record = self.shared.framer.frame(channel, body)?;
        if let Some(limiter) = &self.shared.limiter {
            limiter.acquire(1).await;
        }
        let ack = self
            .shared
            .client
            .produce(record, self.shared.config.acks)
            .await
            .map_err(|e| PubSubError::unavailable(channel, e))?;
        metrics::inc_published();
        debug!(%channel, topic = %ack.topic, offset = ack.offset, "payload published");
        Ok(())
    }

    /// Register `callback` for every payload published on `channel`.
    ///
    /// Resolves only once the channel's broker consumer is ready. Callbacks
    /// run on the channel task; a panicking callback is logged and does not
    /// affect other listeners.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Closed`] after [`close`](Self::close),
    /// [`PubSubError::BrokerUnavailable`] if the consumer cannot be created or
    /// started and [`PubSubError::ReadyTimeout`] if it does not become ready
    /// within the configured timeout.
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(P) + Send + Sync + 'static,
    {
        self.register(channel, SinkKind::Callback(Arc::new(callback)))
            .await
    }

    /// Remove a subscription or cursor registration.
    ///
    /// Tears down the channel's broker consumer when the last registration
    /// goes away. Returns false if `id` was not registered, so repeated calls
    /// are harmless.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool { self.registry.remove(id) }

    /// Open a pull cursor on `channel`.
    ///
    /// Resolves only once the channel's broker consumer is ready.
    ///
    /// # Errors
    ///
    /// Fails in the same cases as [`subscribe`](Self::subscribe).
    pub async fn async_iterator(&self, channel: &str) -> Result<ChannelCursor<P>> {
        let queue = Arc::new(CursorQueue::new());
        let id = self
            .register(channel, SinkKind::Cursor(Arc::clone(&queue)))
            .await?;
        Ok(ChannelCursor::new(
            channel.to_owned(),
            id,
            queue,
            self.registry.downgrade(),
        ))
    }

    /// Tear down every channel, subscription and cursor and wait for the
    /// broker consumers to stop.
    ///
    /// Pending and future cursor pulls resolve to `None`; later publishes and
    /// registrations fail with [`PubSubError::Closed`]. Teardown errors are
    /// logged, never returned. Calling `close` again only waits.
    pub async fn close(&self) {
        let first = !self.shared.closed.swap(true, Ordering::AcqRel);
        if first {
            self.registry.close();
            self.shared.root.cancel();
            self.shared.tracker.close();
        }
        self.shared.tracker.wait().await;
        if first {
            info!("pubsub adapter closed");
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.registry.is_closed()
    }

    /// Current consumption state of `channel`.
    #[must_use]
    pub fn channel_state(&self, channel: &str) -> ChannelState {
        self.registry.channel_state(channel)
    }

    /// Number of callbacks and cursors registered on `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize { self.registry.listener_count(channel) }

    /// Channels that currently have a live broker consumer, sorted by name.
    #[must_use]
    pub fn active_channels(&self) -> Vec<String> { self.registry.active_channels() }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(PubSubError::Closed)
        } else {
            Ok(())
        }
    }

    async fn ensure_connected(&self, channel: &str) -> Result<()> {
        let shared = &self.shared;
        shared
            .connected
            .get_or_try_init(|| async {
                shared.client.connect(&shared.config.broker).await?;
                info!(endpoint = %shared.config.broker.endpoint(), "broker connected");
                Ok::<(), BrokerError>(())
            })
            .await
            .map(|_| ())
            .map_err(|e| PubSubError::unavailable(channel, e))
    }

    /// Register `kind` on `channel`, establishing the channel's consumer first
    /// if nobody else is.
    async fn register(&self, channel: &str, kind: SinkKind<P>) -> Result<SubscriptionId> {
        loop {
            self.ensure_open()?;
            match self.registry.claim(channel, &kind)? {
                Claim::Registered(id) => return Ok(id),
                Claim::Wait(mut starting) => {
                    trace!(%channel, "waiting for channel consumer");
                    // Resolves with an error once the establishing caller
                    // drops its guard, whatever the outcome.
                    let _ = starting.changed().await;
                }
                Claim::Establish(guard) => {
                    let consumer = self.establish(channel).await?;
                    let Activation { id, sinks, cancel } =
                        match self.registry.activate(guard, kind) {
                            Ok(activation) => activation,
                            Err(e) => {
                                stop_consumer(channel, consumer).await;
                                return Err(e);
                            }
                        };
                    self.spawn_channel(channel.to_owned(), consumer, sinks, cancel);
                    return Ok(id);
                }
            }
        }
    }

    /// Create and start a consumer for `channel`, waiting for readiness.
    async fn establish(&self, channel: &str) -> Result<Box<dyn BrokerConsumer>> {
        self.ensure_connected(channel).await?;
        let topic = self.shared.framer.topic_for(channel);
        let mut consumer = self
            .shared
            .client
            .consumer(&topic)
            .await
            .map_err(|e| PubSubError::unavailable(channel, e))?;
        let ready_timeout = self.shared.config.ready_timeout;
        match timeout(ready_timeout, consumer.start()).await {
            Ok(Ok(())) => {
                debug!(%channel, %topic, "channel consumer ready");
                Ok(consumer)
            }
            Ok(Err(e)) => {
                stop_consumer(channel, consumer).await;
                Err(PubSubError::unavailable(channel, e))
            }
            Err(_) => {
                warn!(%channel, %topic, ?ready_timeout, "channel consumer not ready in time");
                stop_consumer(channel, consumer).await;
                Err(PubSubError::ReadyTimeout {
                    channel: channel.to_owned(),
                    timeout: ready_timeout,
                })
            }
        }
    }

    fn spawn_channel(
        &self,
        channel: String,
        consumer: Box<dyn BrokerConsumer>,
        sinks: Arc<SinkSet<P>>,
        cancel: CancellationToken,
    ) {
        let task = ChannelTask {
            channel,
            consumer,
            sinks,
            cancel,
            codec: Arc::clone(&self.shared.codec),
            framer: Arc::clone(&self.shared.framer),
            registry: self.registry.downgrade(),
            backoff: self.shared.config.consumer_backoff.normalized(),
        };
        metrics::inc_channels();
        self.shared.tracker.spawn(task.run());
    }
}

async fn stop_consumer(channel: &str, mut consumer: Box<dyn BrokerConsumer>) {
    if let Err(e) = consumer.stop().await {
        warn!(%channel, error = %e, "failed to stop channel consumer");
    }
}

/// Consumption loop of one active channel.
struct ChannelTask<P, C> {
    channel: String,
    consumer: Box<dyn BrokerConsumer>,
    sinks: Arc<SinkSet<P>>,
    cancel: CancellationToken,
    codec: Arc<C>,
    framer: Arc<Framer>,
    registry: std::sync::Weak<Registry<P>>,
    backoff: BackoffConfig,
}

impl<P: Payload, C: PayloadCodec> ChannelTask<P, C> {
    async fn run(mut self) {
        let mut delay = self.backoff.initial_delay;
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                next = self.consumer.next_record() => match next {
                    Some(Ok(record)) => {
                        delay = self.backoff.initial_delay;
                        self.dispatch(&record);
                    }
                    Some(Err(e)) => {
                        warn!(channel = %self.channel, error = %e, ?delay, "broker consumer error");
                        tokio::select! {
                            biased;

                            () = self.cancel.cancelled() => break,
                            () = sleep(delay) => {}
                        }
                        delay = self.backoff.next(delay);
                    }
                    None => {
                        warn!(channel = %self.channel, "broker ended channel stream");
                        if let Some(registry) = self.registry.upgrade() {
                            registry.end_channel(&self.channel, &self.sinks);
                        }
                        break;
                    }
                },
            }
        }
        stop_consumer(&self.channel, self.consumer).await;
        metrics::dec_channels();
        debug!(channel = %self.channel, "channel task finished");
    }

    fn dispatch(&self, record: &BrokerRecord) {
        let (channel, body) = match self.framer.unframe(record) {
            Ok(parts) => parts,
            Err(e) => {
                metrics::inc_decode_errors();
                warn!(channel = %self.channel, topic = %record.topic, offset = ?record.offset, error = %e, "dropping unframeable record");
                return;
            }
        };
        if channel != self.channel {
            trace!(channel = %self.channel, other = %channel, "skipping record for another channel");
            return;
        }
        let payload: P = match self.codec.decode(&body) {
            Ok(payload) => payload,
            Err(e) => {
                metrics::inc_decode_errors();
                warn!(channel = %self.channel, offset = ?record.offset, error = %e, "dropping undecodable payload");
                return;
            }
        };
        let sinks = self.sinks.snapshot();
        trace!(channel = %self.channel, offset = ?record.offset, listeners = sinks.len(), "fanning out payload");
        for sink in sinks {
            sink.deliver(&self.channel, &payload);
        }
    }
}
