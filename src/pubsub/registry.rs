//! Per-channel registry of listeners and channel lifecycle state.
//!
//! A channel is either absent (unconsumed), `Starting` while the first
//! registration waits for its broker consumer, or `Active` with a shared
//! [`SinkSet`] that the channel task fans records out to. Each activation
//! gets a fresh `SinkSet`, so a task that is still winding down after its
//! channel was torn down never delivers to registrations made afterwards.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{ChannelState, SubscriptionId, cursor::CursorQueue};
use crate::{
    codec::Payload,
    error::{ListenerError, PubSubError},
    metrics,
    panic::format_panic,
};

/// Callback registered through [`PubSub::subscribe`](super::PubSub::subscribe).
pub(crate) type Callback<P> = Arc<dyn Fn(P) + Send + Sync>;

/// What a registration does with each delivered payload.
pub(crate) enum SinkKind<P> {
    /// Invoke immediately on the channel task.
    Callback(Callback<P>),
    /// Enqueue for a pull cursor.
    Cursor(Arc<CursorQueue<P>>),
}

impl<P> Clone for SinkKind<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(cb) => Self::Callback(Arc::clone(cb)),
            Self::Cursor(queue) => Self::Cursor(Arc::clone(queue)),
        }
    }
}

/// A registered listener.
pub(crate) struct Sink<P> {
    id: SubscriptionId,
    active: AtomicBool,
    kind: SinkKind<P>,
}

impl<P> Sink<P> {
    fn new(id: SubscriptionId, kind: SinkKind<P>) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            kind,
        }
    }

    /// Stop further deliveries and release a waiting puller.
    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        if let SinkKind::Cursor(queue) = &self.kind {
            queue.terminate();
        }
    }

    /// Stop further deliveries; a cursor keeps what it already received.
    fn retire(&self) {
        self.active.store(false, Ordering::Release);
        if let SinkKind::Cursor(queue) = &self.kind {
            queue.end();
        }
    }
}

impl<P: Payload> Sink<P> {
    /// Hand `payload` to this sink unless it was removed after the snapshot
    /// was taken. Callback panics are caught and logged.
    pub(crate) fn deliver(&self, channel: &str, payload: &P) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        match &self.kind {
            SinkKind::Cursor(queue) => {
                queue.push(payload.clone());
                metrics::inc_delivered(metrics::Delivery::Cursor);
            }
            SinkKind::Callback(callback) => {
                let value = payload.clone();
                match catch_unwind(AssertUnwindSafe(|| (callback.as_ref())(value))) {
                    Ok(()) => metrics::inc_delivered(metrics::Delivery::Callback),
                    Err(panic) => {
                        let failure = ListenerError {
                            channel: channel.to_owned(),
                            subscription: self.id,
                            panic: format_panic(&*panic),
                        };
                        metrics::inc_listener_errors();
                        // Emit via both `log` and `tracing` for tests that capture either.
                        log::error!("listener panicked: {failure}");
                        error!(%channel, subscription = %self.id, error = %failure, "listener panicked");
                    }
                }
            }
        }
    }
}

/// Listeners of one channel activation, shared with its channel task.
pub(crate) struct SinkSet<P> {
    sinks: Mutex<Vec<Arc<Sink<P>>>>,
}

impl<P> SinkSet<P> {
    fn with_sink(sink: Sink<P>) -> Self {
        Self {
            sinks: Mutex::new(vec![Arc::new(sink)]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Sink<P>>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, sink: Sink<P>) { self.lock().push(Arc::new(sink)); }

    /// Deactivate and remove `id`, returning it and whether the set is now
    /// empty. The caller drops the sink once no lock is held.
    fn remove(&self, id: SubscriptionId) -> (Option<Arc<Sink<P>>>, bool) {
        let mut sinks = self.lock();
        let removed = sinks
            .iter()
            .position(|sink| sink.id == id)
            .map(|pos| sinks.remove(pos));
        if let Some(sink) = &removed {
            sink.deactivate();
        }
        (removed, sinks.is_empty())
    }

    fn drain(&self) -> Vec<Arc<Sink<P>>> { self.lock().drain(..).collect() }

    /// Copy the current listeners so delivery runs without the lock held.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Sink<P>>> { self.lock().clone() }

    pub(crate) fn len(&self) -> usize { self.lock().len() }
}

struct ActiveChannel<P> {
    sinks: Arc<SinkSet<P>>,
    cancel: CancellationToken,
}

enum ChannelSlot<P> {
    Starting(watch::Receiver<()>),
    Active(ActiveChannel<P>),
}

struct RegistryState<P> {
    channels: HashMap<String, ChannelSlot<P>>,
    index: HashMap<SubscriptionId, String>,
    closed: bool,
}

/// Outcome of attempting to register on a channel.
pub(crate) enum Claim<P> {
    /// The channel was active and the sink is registered.
    Registered(SubscriptionId),
    /// Another caller is establishing the consumer; wait for it to finish.
    Wait(watch::Receiver<()>),
    /// The caller must establish the consumer and then call
    /// [`Registry::activate`].
    Establish(StartGuard<P>),
}

/// Everything a freshly activated channel task needs.
pub(crate) struct Activation<P> {
    pub(crate) id: SubscriptionId,
    pub(crate) sinks: Arc<SinkSet<P>>,
    pub(crate) cancel: CancellationToken,
}

/// Marks a channel as `Starting` until dropped or activated.
///
/// Dropping the guard without activating (for example when the subscribing
/// future is cancelled) clears the slot and wakes waiters.
pub(crate) struct StartGuard<P> {
    channel: String,
    registry: Option<Weak<Registry<P>>>,
    _tx: watch::Sender<()>,
}

impl<P> Drop for StartGuard<P> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.abandon(&self.channel);
        }
    }
}

/// Registry shared by the adapter, its channel tasks and its cursors.
pub(crate) struct Registry<P> {
    state: Mutex<RegistryState<P>>,
    next_id: AtomicU64,
    root: CancellationToken,
}

impl<P> Registry<P> {
    fn lock(&self) -> MutexGuard<'_, RegistryState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear a `Starting` slot whose consumer could not be established.
    fn abandon(&self, channel: &str) {
        let mut state = self.lock();
        if matches!(state.channels.get(channel), Some(ChannelSlot::Starting(_))) {
            state.channels.remove(channel);
        }
    }
}

impl<P: Payload> Registry<P> {
    pub(crate) fn new(root: CancellationToken) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                channels: HashMap::new(),
                index: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            root,
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register on an active channel, or learn what must happen first.
    pub(crate) fn claim(
        self: &Arc<Self>,
        channel: &str,
        kind: &SinkKind<P>,
    ) -> Result<Claim<P>, PubSubError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(PubSubError::Closed);
        }
        match state.channels.get(channel) {
            Some(ChannelSlot::Active(active)) => {
                let id = self.allocate_id();
                active.sinks.insert(Sink::new(id, kind.clone()));
                state.index.insert(id, channel.to_owned());
                debug!(%channel, subscription = %id, "listener registered");
                Ok(Claim::Registered(id))
            }
            Some(ChannelSlot::Starting(rx)) => Ok(Claim::Wait(rx.clone())),
            None => {
                let (tx, rx) = watch::channel(());
                state
                    .channels
                    .insert(channel.to_owned(), ChannelSlot::Starting(rx));
                Ok(Claim::Establish(StartGuard {
                    channel: channel.to_owned(),
                    registry: Some(Arc::downgrade(self)),
                    _tx: tx,
                }))
            }
        }
    }

    /// Promote a `Starting` channel to `Active` with `kind` as its first sink.
    pub(crate) fn activate(
        &self,
        mut guard: StartGuard<P>,
        kind: SinkKind<P>,
    ) -> Result<Activation<P>, PubSubError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PubSubError::Closed);
        }
        guard.registry = None;
        let id = self.allocate_id();
        let sinks = Arc::new(SinkSet::with_sink(Sink::new(id, kind)));
        let cancel = self.root.child_token();
        state.channels.insert(
            guard.channel.clone(),
            ChannelSlot::Active(ActiveChannel {
                sinks: Arc::clone(&sinks),
                cancel: cancel.clone(),
            }),
        );
        state.index.insert(id, guard.channel.clone());
        debug!(channel = %guard.channel, subscription = %id, "channel active");
        Ok(Activation { id, sinks, cancel })
    }

    /// Remove a registration, tearing the channel down if it was the last.
    ///
    /// Returns false if `id` was not registered.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(channel) = state.index.remove(&id) else {
            return false;
        };
        let (removed, now_empty) = match state.channels.get(&channel) {
            Some(ChannelSlot::Active(active)) => active.sinks.remove(id),
            _ => (None, false),
        };
        debug!(%channel, subscription = %id, "listener removed");
        if now_empty {
            if let Some(ChannelSlot::Active(active)) = state.channels.remove(&channel) {
                active.cancel.cancel();
                debug!(%channel, "channel unconsumed");
            }
        }
        drop(guard);
        // A callback may own a cursor whose drop re-enters the registry.
        drop(removed);
        true
    }

    /// Tear down the activation owning `sinks` after its broker stream ended.
    /// Cursors keep the payloads they already received.
    pub(crate) fn end_channel(&self, channel: &str, sinks: &Arc<SinkSet<P>>) {
        let mut state = self.lock();
        let owns = matches!(
            state.channels.get(channel),
            Some(ChannelSlot::Active(active)) if Arc::ptr_eq(&active.sinks, sinks)
        );
        if owns {
            state.channels.remove(channel);
        }
        let removed = sinks.drain();
        for sink in &removed {
            sink.retire();
            state.index.remove(&sink.id);
        }
        drop(state);
        drop(removed);
    }

    /// Mark the registry closed and terminate every registration.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let mut removed = Vec::new();
        for (channel, slot) in state.channels.drain() {
            if let ChannelSlot::Active(active) = slot {
                let sinks = active.sinks.drain();
                for sink in &sinks {
                    sink.deactivate();
                }
                active.cancel.cancel();
                debug!(%channel, listeners = sinks.len(), "channel closed");
                removed.extend(sinks);
            }
        }
        state.index.clear();
        drop(state);
        drop(removed);
    }

    pub(crate) fn is_closed(&self) -> bool { self.lock().closed }

    pub(crate) fn channel_state(&self, channel: &str) -> ChannelState {
        match self.lock().channels.get(channel) {
            None => ChannelState::Unconsumed,
            Some(ChannelSlot::Starting(_)) => ChannelState::Starting,
            Some(ChannelSlot::Active(_)) => ChannelState::Active,
        }
    }

    pub(crate) fn listener_count(&self, channel: &str) -> usize {
        match self.lock().channels.get(channel) {
            Some(ChannelSlot::Active(active)) => active.sinks.len(),
            _ => 0,
        }
    }

    pub(crate) fn active_channels(&self) -> Vec<String> {
        let state = self.lock();
        let mut channels: Vec<String> = state
            .channels
            .iter()
            .filter(|(_, slot)| matches!(slot, ChannelSlot::Active(_)))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Weak handle for cursors, which must not keep the registry alive.
    pub(crate) fn downgrade(self: &Arc<Self>) -> Weak<Self> { Arc::downgrade(self) }
}

impl<P> Drop for Registry<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in state.channels.values() {
            if let ChannelSlot::Active(active) = slot {
                for sink in active.sinks.drain() {
                    sink.deactivate();
                }
                active.cancel.cancel();
            }
        }
    }
}
