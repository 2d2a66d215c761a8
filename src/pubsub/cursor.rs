//! Pull-based consumption of a channel.
//!
//! A [`ChannelCursor`] owns a private unbounded queue that the channel task
//! fills. Pulls take `&self`, so a cursor can be shared between tasks; only
//! one pull may be outstanding at a time and a second concurrent pull fails
//! with [`PubSubError::ConcurrentPull`]. Once terminated, every pull resolves
//! to `None` and the cursor cannot be restarted. When the broker ends the
//! channel's stream the cursor first yields what it already received.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Mutex,
        PoisonError,
        Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::Stream;
use tokio::sync::Notify;

use super::{SubscriptionId, registry::Registry};
use crate::{
    codec::Payload,
    error::{PubSubError, Result},
};

/// Pending payloads of one cursor and its wake-up slot.
pub(crate) struct CursorQueue<P> {
    items: Mutex<VecDeque<P>>,
    notify: Notify,
    terminated: AtomicBool,
    ended: AtomicBool,
    pulling: AtomicBool,
}

impl<P> CursorQueue<P> {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            terminated: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            pulling: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, item: P) {
        if self.terminated.load(Ordering::Acquire) || self.ended.load(Ordering::Acquire) {
            return;
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self.notify.notify_one();
    }

    /// Drop queued payloads and wake the waiting puller, if any.
    pub(crate) fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.notify.notify_one();
    }

    /// Accept no further payloads but keep queued ones for pulling.
    pub(crate) fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_one();
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
            || (self.ended.load(Ordering::Acquire) && self.len() == 0)
    }

    fn pop(&self) -> Option<P> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize { self.items.lock().unwrap_or_else(PoisonError::into_inner).len() }

    /// Wait for the next payload or termination.
    ///
    /// `notify_one` stores a permit when nobody is waiting, so a push or
    /// termination racing with the checks below is never lost.
    async fn pull(&self) -> Option<P> {
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.ended.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// Holds the single pull slot of a cursor; released on drop so a cancelled
/// `next()` does not wedge the cursor.
struct PullSlot<'a, P>(&'a CursorQueue<P>);

impl<'a, P> PullSlot<'a, P> {
    fn acquire(queue: &'a CursorQueue<P>) -> Option<Self> {
        queue
            .pulling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(queue))
    }
}

impl<P> Drop for PullSlot<'_, P> {
    fn drop(&mut self) { self.0.pulling.store(false, Ordering::Release); }
}

/// Pull handle over one channel, returned by
/// [`PubSub::async_iterator`](super::PubSub::async_iterator).
///
/// Dropping the cursor terminates it.
pub struct ChannelCursor<P: Payload> {
    channel: String,
    id: SubscriptionId,
    queue: std::sync::Arc<CursorQueue<P>>,
    registry: Weak<Registry<P>>,
}

impl<P: Payload> ChannelCursor<P> {
    pub(crate) fn new(
        channel: String,
        id: SubscriptionId,
        queue: std::sync::Arc<CursorQueue<P>>,
        registry: Weak<Registry<P>>,
    ) -> Self {
        Self {
            channel,
            id,
            queue,
            registry,
        }
    }

    /// Channel this cursor reads from.
    #[must_use]
    pub fn channel(&self) -> &str { &self.channel }

    /// Registration identifier; also accepted by
    /// [`PubSub::unsubscribe`](super::PubSub::unsubscribe).
    #[must_use]
    pub fn id(&self) -> SubscriptionId { self.id }

    /// Number of payloads received but not yet pulled.
    #[must_use]
    pub fn pending(&self) -> usize { self.queue.len() }

    /// Returns true once the cursor will yield no further payloads.
    #[must_use]
    pub fn is_terminated(&self) -> bool { self.queue.is_terminated() }

    /// Wait for the next payload.
    ///
    /// Resolves to `Ok(None)` once the cursor is terminated, unsubscribed or
    /// the adapter is closed. If the broker ended the channel's stream,
    /// payloads already received are yielded first.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::ConcurrentPull`] if another `next()` on this
    /// cursor has not yet resolved.
    pub async fn next(&self) -> Result<Option<P>> {
        let _slot = PullSlot::acquire(&self.queue).ok_or_else(|| PubSubError::ConcurrentPull {
            channel: self.channel.clone(),
        })?;
        Ok(self.queue.pull().await)
    }

    /// Stop the cursor and deregister it; pending and later pulls resolve to
    /// `None`. Tears the channel down if this was its last registration.
    /// Idempotent.
    pub fn terminate(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.queue.terminate();
    }

    /// Consume the cursor as a [`Stream`] that ends when the cursor is
    /// terminated.
    pub fn into_stream(self) -> impl Stream<Item = P> + Send + 'static {
        futures::stream::unfold(self, |cursor| async move {
            let next = cursor.next().await;
            match next {
                Ok(Some(item)) => Some((item, cursor)),
                Ok(None) | Err(_) => None,
            }
        })
    }
}

impl<P: Payload> Drop for ChannelCursor<P> {
    fn drop(&mut self) { self.terminate(); }
}

impl<P: Payload> fmt::Debug for ChannelCursor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCursor")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}
