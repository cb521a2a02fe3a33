//! Who is online in the room, and who wants to hear about it.
//!
//! One mutex guards the attendant map and both subscriber lists. Every
//! change is pushed into each subscriber's queue before the lock is
//! released, so all subscribers see changes in the same order. Each queue
//! is drained by the stream that registered it. Queues are bounded: a
//! subscriber that falls a full queue behind is dropped, and its stream
//! sees the end of the queue once it catches up.

use crate::metrics::gauges;
use room_common::muxrpc::Endpoint;
use room_common::FeedRef;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Updates a subscriber may lag behind before it is dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Update pushed to `room.attendants` subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttendantEvent {
    /// Everyone present when the subscription started.
    State {
        /// Sorted feeds.
        ids: Vec<FeedRef>,
    },
    /// A peer became reachable.
    Joined {
        /// The peer.
        id: FeedRef,
    },
    /// A peer went away.
    Left {
        /// The peer.
        id: FeedRef,
    },
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

impl<T> Subscriber<T> {
    /// Queue `item`. False once the reader is gone or a full queue behind.
    fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = self.id, "dropping subscriber that fell behind");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct Inner<S> {
    attendants: BTreeMap<FeedRef, S>,
    legacy: Vec<Subscriber<Vec<FeedRef>>>,
    typed: Vec<Subscriber<AttendantEvent>>,
    next_subscriber: u64,
}

impl<S> Inner<S> {
    fn snapshot(&self) -> Vec<FeedRef> {
        self.attendants.keys().copied().collect()
    }

    fn emit(&mut self, event: &AttendantEvent) {
        self.typed.retain(|sub| sub.push(event.clone()));
    }

    fn emit_snapshot(&mut self) {
        let snapshot = self.snapshot();
        self.legacy.retain(|sub| sub.push(snapshot.clone()));
        gauges::set_attendants(snapshot.len());
    }
}

/// Online peers keyed by feed, generic over the session handle.
pub struct RoomState<S = Endpoint> {
    inner: Arc<Mutex<Inner<S>>>,
}

impl<S> Clone for RoomState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Clone> Default for RoomState<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> RoomState<S> {
    /// Empty room.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                attendants: BTreeMap::new(),
                legacy: Vec::new(),
                typed: Vec::new(),
                next_subscriber: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set `feed`'s session, replacing any earlier one.
    ///
    /// A replaced entry is announced as `left` right before the new
    /// `joined`, so subscribers never see two joins in a row.
    pub fn add_endpoint(&self, feed: FeedRef, session: S) {
        let mut inner = self.lock();
        if inner.attendants.insert(feed, session).is_some() {
            inner.emit(&AttendantEvent::Left { id: feed });
        }
        inner.emit(&AttendantEvent::Joined { id: feed });
        inner.emit_snapshot();
    }

    /// Insert `feed` unless present. Returns true if it was already there.
    pub fn already_added(&self, feed: FeedRef, session: S) -> bool {
        let mut inner = self.lock();
        if inner.attendants.contains_key(&feed) {
            return true;
        }
        inner.attendants.insert(feed, session);
        inner.emit(&AttendantEvent::Joined { id: feed });
        inner.emit_snapshot();
        false
    }

    /// Drop `feed`. Returns whether it was present.
    pub fn remove(&self, feed: &FeedRef) -> bool {
        self.remove_if(feed, |_| true)
    }

    /// Drop `feed` only if `pred` accepts its current session.
    pub fn remove_if(&self, feed: &FeedRef, pred: impl FnOnce(&S) -> bool) -> bool {
        let mut inner = self.lock();
        if !inner.attendants.get(feed).is_some_and(pred) {
            return false;
        }
        inner.attendants.remove(feed);
        inner.emit(&AttendantEvent::Left { id: *feed });
        inner.emit_snapshot();
        true
    }

    /// Session of `feed`, if online.
    #[must_use]
    pub fn has(&self, feed: &FeedRef) -> Option<S> {
        self.lock().attendants.get(feed).cloned()
    }

    /// Online feeds, sorted by canonical string.
    #[must_use]
    pub fn list(&self) -> Vec<FeedRef> {
        self.lock().snapshot()
    }

    /// Number of online feeds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().attendants.len()
    }

    /// Returns `true` if nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to full snapshots. The current one is queued first.
    #[must_use]
    pub fn register_legacy(&self) -> Subscription<Vec<FeedRef>, S> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        let _ = tx.try_send(inner.snapshot());
        inner.legacy.push(Subscriber { id, tx });
        Subscription {
            id,
            rx,
            room: self.clone(),
            kind: Kind::Legacy,
        }
    }

    /// Subscribe to typed deltas. A `state` event is queued first.
    #[must_use]
    pub fn register_attendants(&self) -> Subscription<AttendantEvent, S> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        let _ = tx.try_send(AttendantEvent::State {
            ids: inner.snapshot(),
        });
        inner.typed.push(Subscriber { id, tx });
        Subscription {
            id,
            rx,
            room: self.clone(),
            kind: Kind::Typed,
        }
    }

    /// Number of registered subscribers of both kinds.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let inner = self.lock();
        inner.legacy.len() + inner.typed.len()
    }

    fn unregister(&self, id: u64, kind: Kind) {
        let mut inner = self.lock();
        match kind {
            Kind::Legacy => inner.legacy.retain(|s| s.id != id),
            Kind::Typed => inner.typed.retain(|s| s.id != id),
        }
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Legacy,
    Typed,
}

/// Queue of room updates. Dropping it unregisters the subscriber.
pub struct Subscription<T, S: Clone = Endpoint> {
    id: u64,
    rx: mpsc::Receiver<T>,
    room: RoomState<S>,
    kind: Kind,
}

impl<T, S: Clone> Subscription<T, S> {
    /// Next update, in the order they were applied. `None` once the
    /// subscriber was dropped for falling behind and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T, S: Clone> Drop for Subscription<T, S> {
    fn drop(&mut self) {
        self.room.unregister(self.id, self.kind);
    }
}
