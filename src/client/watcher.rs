//! # Watcher Dispatcher
//!
//! Ordered delivery of connection-state events.
//!
//! Each watcher gets its own bounded queue and delivery task. Every watcher
//! sees every event exactly once, in production order. A full queue makes
//! `publish` wait: events are never dropped. A panicking watcher is logged
//! and keeps receiving later events.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::observability::{log_event_with_fields, ClientMetrics, Event};

use super::state::KeeperState;

/// Event handed to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub state: KeeperState,
    /// Reserved for data-tree events; always `None` for state changes
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn state(state: KeeperState) -> Self {
        Self { state, path: None }
    }
}

/// Observer of session state changes.
#[async_trait]
pub trait Watcher: Send + Sync + 'static {
    async fn process(&self, event: WatchedEvent);
}

/// Adapts a closure into a `Watcher`.
pub struct FnWatcher<F>(pub F);

#[async_trait]
impl<F> Watcher for FnWatcher<F>
where
    F: Fn(WatchedEvent) + Send + Sync + 'static,
{
    async fn process(&self, event: WatchedEvent) {
        (self.0)(event)
    }
}

/// Forwards events into a bounded channel.
pub struct ChannelWatcher {
    sender: mpsc::Sender<WatchedEvent>,
}

impl ChannelWatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WatchedEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Watcher for ChannelWatcher {
    async fn process(&self, event: WatchedEvent) {
        // A dropped receiver just stops listening
        let _ = self.sender.send(event).await;
    }
}

/// Registration handle.
pub type WatcherId = u64;

struct Registration {
    id: WatcherId,
    sender: mpsc::Sender<WatchedEvent>,
}

/// Fans state events out to registered watchers.
pub struct WatcherDispatcher {
    capacity: usize,
    next_id: AtomicU64,
    watchers: RwLock<Vec<Registration>>,
    metrics: Arc<ClientMetrics>,
}

impl WatcherDispatcher {
    pub fn new(capacity: usize, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            watchers: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// Register a watcher. It sees events published from now on.
    ///
    /// Must be called within a Tokio runtime.
    pub fn register(&self, watcher: Arc<dyn Watcher>) -> WatcherId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        tokio::spawn(deliver(id, watcher, receiver, Arc::clone(&self.metrics)));

        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { id, sender });
        id
    }

    /// Stop delivering to a watcher. Already queued events are still
    /// delivered.
    pub fn unregister(&self, id: WatcherId) -> bool {
        let mut watchers = self.watchers.write().unwrap_or_else(PoisonError::into_inner);
        let before = watchers.len();
        watchers.retain(|registration| registration.id != id);
        watchers.len() != before
    }

    /// Queue an event for every watcher, waiting for queue space.
    pub async fn publish(&self, event: WatchedEvent) {
        let senders: Vec<mpsc::Sender<WatchedEvent>> = self
            .watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|registration| registration.sender.clone())
            .collect();

        for sender in senders {
            if sender.send(event.clone()).await.is_ok() {
                self.metrics.increment_events_delivered();
            }
        }
    }

    /// Drop every registration. Delivery tasks drain their queues and exit.
    pub fn shutdown(&self) {
        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn deliver(
    id: WatcherId,
    watcher: Arc<dyn Watcher>,
    mut events: mpsc::Receiver<WatchedEvent>,
    metrics: Arc<ClientMetrics>,
) {
    while let Some(event) = events.recv().await {
        let state = event.state;
        if AssertUnwindSafe(watcher.process(event))
            .catch_unwind()
            .await
            .is_err()
        {
            metrics.increment_watcher_panics();
            log_event_with_fields(
                Event::WatcherPanicked,
                &[("state", state.as_str()), ("watcher_id", &id.to_string())],
            );
        }
    }
}
