//! EventBus - process-wide publish/subscribe channel.
//!
//! Every subscription owns an unbounded queue drained by its own delivery
//! task, so a publish never blocks and never drops: each subscriber sees every
//! matching event published while it was registered, in publish order.
//! A handler that errors or panics is logged and does not affect delivery to
//! any other subscriber.

mod types;


pub use types::{topics, Event, TopicPattern, CORE_SOURCE};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Receives events for a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event. Errors are logged and otherwise ignored.
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Wrap a synchronous closure as an [`EventHandler`]
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handle returned by [`EventBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    pattern: String,
}

impl Subscription {
    /// Subscription id, unique per bus
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Topic pattern this subscription listens on
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

struct Subscriber {
    pattern: TopicPattern,
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

struct BusInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

/// Fan-out event bus shared by every component of the host.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish a core event. Returns the number of subscribers it was queued for.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        self.publish_event(Event::new(CORE_SOURCE, topic, payload))
    }

    /// Publish an event on behalf of `source` (usually a plugin name)
    pub fn emit(&self, source: &str, topic: &str, payload: Value) -> usize {
        self.publish_event(Event::new(source, topic, payload))
    }

    /// Publish a fully built event
    pub fn publish_event(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        for entry in self.inner.subscribers.iter() {
            if entry.pattern.matches(&event.topic) && entry.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(topic = %event.topic, source = %event.source, delivered, "Event published");
        delivered
    }

    /// Register a handler for every topic matching `pattern`.
    ///
    /// Must be called from within a tokio runtime; the handler runs on a
    /// dedicated delivery task.
    pub fn subscribe(
        &self,
        pattern: impl Into<TopicPattern>,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let (subscription, mut rx) = self.subscribe_channel(pattern);
        let label = subscription.pattern.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(topic = %event.topic, pattern = %label, error = %e, "Event handler failed");
                    }
                    Err(_) => {
                        error!(topic = %event.topic, pattern = %label, "Event handler panicked");
                    }
                }
            }
        });
        subscription
    }

    /// Subscribe and receive matching events on a channel instead of a handler
    pub fn subscribe_channel(
        &self,
        pattern: impl Into<TopicPattern>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Arc<Event>>) {
        let pattern = pattern.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let subscription = Subscription {
            id,
            pattern: pattern.as_str().to_string(),
        };
        self.inner.subscribers.insert(id, Subscriber { pattern, tx });
        (subscription, rx)
    }

    /// Remove a subscription. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.subscribers.remove(&subscription.id).is_some()
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
