//! The Event Bus (C11, §4.7): a mapping from lifecycle token to a
//! subscriber + bounded buffer, protected by a single lock the way
//! [`runnerctl_store::InMemoryStore`] protects its map — one `RwLock`
//! around a `HashMap`, short critical sections, no lock held across `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use runnerctl_domain::LifecycleToken;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::EventsError;
use crate::event::Event;

/// Events buffered per token before overflow discards the oldest (§4.7:
/// "bounded; overflow discards oldest").
const DEFAULT_BUFFER_CAPACITY: usize = 256;

enum Slot {
    /// No subscriber attached yet; events accumulate here.
    Buffering(VecDeque<Event>),
    /// A subscriber is attached; events are forwarded directly.
    Live(mpsc::UnboundedSender<Event>),
}

#[derive(Default)]
struct Inner {
    slots: HashMap<LifecycleToken, Slot>,
}

/// Correlates background pipeline events with a waiting client via a
/// lifecycle token. Safe to clone and share across tasks.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a lifecycle token so `subscribe` will succeed for it even
    /// if no events have been emitted yet. Called when a request dispatches
    /// a background pipeline and hands the caller a token to subscribe with.
    pub async fn register(&self, token: LifecycleToken) {
        let mut guard = self.inner.write().await;
        guard
            .slots
            .entry(token)
            .or_insert_with(|| Slot::Buffering(VecDeque::new()));
    }

    /// Emits an event under `token`. If a subscriber is attached, the event
    /// is forwarded immediately; otherwise it is buffered (oldest dropped on
    /// overflow). A token with no registration at all is registered
    /// implicitly — a pipeline stage should never lose an event because the
    /// caller hasn't called `register` yet.
    pub async fn emit(&self, token: &LifecycleToken, event: Event) {
        let mut guard = self.inner.write().await;
        let slot = guard
            .slots
            .entry(token.clone())
            .or_insert_with(|| Slot::Buffering(VecDeque::new()));

        match slot {
            Slot::Live(tx) => {
                if tx.send(event).is_err() {
                    // Subscriber dropped its receiver; fall back to buffering.
                    *slot = Slot::Buffering(VecDeque::new());
                }
            }
            Slot::Buffering(buf) => {
                if buf.len() >= DEFAULT_BUFFER_CAPACITY {
                    buf.pop_front();
                }
                buf.push_back(event);
            }
        }
    }

    /// Attaches a subscriber to `token`, draining any buffered events first
    /// (§4.7: "On attach, buffered events are drained before live events").
    /// Returns `UnknownToken` if the token was never registered — callers
    /// are expected to have already checked the token against a live runner
    /// record before calling this (§4.7: "authorized only if the lifecycle
    /// token matches a live runner").
    pub async fn subscribe(
        &self,
        token: &LifecycleToken,
    ) -> Result<mpsc::UnboundedReceiver<Event>, EventsError> {
        let mut guard = self.inner.write().await;
        let slot = guard
            .slots
            .get_mut(token)
            .ok_or_else(|| EventsError::UnknownToken(token.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Slot::Buffering(buf) = slot {
            for event in buf.drain(..) {
                let _ = tx.send(event);
            }
        }
        *slot = Slot::Live(tx);
        Ok(rx)
    }

    /// Removes all state for `token`. Called once a runner reaches a
    /// terminal state and its subscriber has disconnected (§4.7: "The bus
    /// does not retain events after the runner reaches a terminal state and
    /// the subscriber disconnects").
    pub async fn retire(&self, token: &LifecycleToken) {
        let mut guard = self.inner.write().await;
        if guard.slots.remove(token).is_some() {
            debug!(token = %token, "event bus slot retired");
        }
    }

    /// True if `token` has been registered (live or buffering).
    pub async fn contains(&self, token: &LifecycleToken) -> bool {
        self.inner.read().await.slots.contains_key(token)
    }
}
