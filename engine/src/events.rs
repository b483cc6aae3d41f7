//! Typed publish/subscribe bus for ledger change notifications.
//!
//! Collaborators (table, chart, summary widgets) subscribe to topics and
//! re-read derived state when an event arrives. Dispatch operates on a
//! snapshot of the subscription list taken at publish time, so handlers
//! that unsubscribe (themselves or others) mid-dispatch never affect the
//! pass already in flight. A handler that fails does not stop the
//! remaining handlers; its error is republished on [`Topic::Error`].

use anyhow::Result;
use shared::{RepairAction, Transaction, TransactionKind};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

/// Everything the ledger announces to its observers.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Loaded,
    Changed,
    TransactionAdded(Transaction),
    TransactionUpdated(Transaction),
    TransactionDeleted { id: String },
    TransactionsBatchAdded { count: usize },
    FiltersApplied(Vec<Transaction>),
    CategoryAdded { kind: TransactionKind, name: String },
    CategoryRemoved { kind: TransactionKind, name: String },
    DataCleared,
    DataRepaired(Vec<RepairAction>),
    /// A handler failed while processing an event on `source`.
    Error { message: String, source: Topic },
}

impl LedgerEvent {
    pub fn topic(&self) -> Topic {
        match self {
            LedgerEvent::Loaded => Topic::Loaded,
            LedgerEvent::Changed => Topic::Changed,
            LedgerEvent::TransactionAdded(_) => Topic::TransactionAdded,
            LedgerEvent::TransactionUpdated(_) => Topic::TransactionUpdated,
            LedgerEvent::TransactionDeleted { .. } => Topic::TransactionDeleted,
            LedgerEvent::TransactionsBatchAdded { .. } => Topic::TransactionsBatchAdded,
            LedgerEvent::FiltersApplied(_) => Topic::FiltersApplied,
            LedgerEvent::CategoryAdded { .. } => Topic::CategoryAdded,
            LedgerEvent::CategoryRemoved { .. } => Topic::CategoryRemoved,
            LedgerEvent::DataCleared => Topic::DataCleared,
            LedgerEvent::DataRepaired(_) => Topic::DataRepaired,
            LedgerEvent::Error { .. } => Topic::Error,
        }
    }
}

/// Subscription key: one topic per event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Loaded,
    Changed,
    TransactionAdded,
    TransactionUpdated,
    TransactionDeleted,
    TransactionsBatchAdded,
    FiltersApplied,
    CategoryAdded,
    CategoryRemoved,
    DataCleared,
    DataRepaired,
    Error,
}

/// Future returned by an event handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// An event handler. Synchronous observers wrap their closure via
/// [`EventBus::subscribe_fn`]; async observers box their future.
pub type Handler = Arc<dyn Fn(LedgerEvent) -> HandlerFuture + Send + Sync>;

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    once: bool,
    handler: Handler,
}

struct BusInner {
    topics: Mutex<HashMap<Topic, Vec<Subscription>>>,
    next_id: AtomicU64,
    max_handlers_per_topic: usize,
}

/// Cheaply cloneable bus handle. All clones share the subscription table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(max_handlers_per_topic: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_handlers_per_topic,
            }),
        }
    }

    /// Register a handler for every future event on `topic`.
    pub fn subscribe(&self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.register(topic, handler, false)
    }

    /// Register a synchronous closure for `topic`.
    pub fn subscribe_fn<F>(&self, topic: Topic, f: F) -> SubscriptionId
    where
        F: Fn(LedgerEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(topic, wrap_sync(f))
    }

    /// Register a handler that fires at most once, then drops itself.
    pub fn once(&self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.register(topic, handler, true)
    }

    fn register(&self, topic: Topic, handler: Handler, once: bool) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.inner.topics.lock().unwrap();
        let subscriptions = topics.entry(topic).or_default();
        subscriptions.push(Subscription { id, once, handler });
        if subscriptions.len() > self.inner.max_handlers_per_topic {
            warn!(
                ?topic,
                count = subscriptions.len(),
                limit = self.inner.max_handlers_per_topic,
                "handler count for topic exceeds configured maximum"
            );
        }
        SubscriptionId(id)
    }

    /// Remove a subscription. Returns whether it was still registered.
    /// Has no effect on a dispatch pass already in flight.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut topics = self.inner.topics.lock().unwrap();
        for subscriptions in topics.values_mut() {
            let before = subscriptions.len();
            subscriptions.retain(|s| s.id != id.0);
            if subscriptions.len() != before {
                return true;
            }
        }
        false
    }

    /// Drop every subscription on every topic.
    pub fn clear(&self) {
        self.inner.topics.lock().unwrap().clear();
    }

    /// Number of live subscriptions for a topic.
    pub fn handler_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap()
            .get(&topic)
            .map_or(0, |subs| subs.len())
    }

    /// Snapshot the handler list for a topic, claiming one-shot entries so
    /// they cannot fire twice.
    fn snapshot(&self, topic: Topic) -> Vec<(u64, Handler)> {
        let mut topics = self.inner.topics.lock().unwrap();
        let Some(subscriptions) = topics.get_mut(&topic) else {
            return Vec::new();
        };
        let snapshot = subscriptions
            .iter()
            .map(|s| (s.id, s.handler.clone()))
            .collect();
        subscriptions.retain(|s| !s.once);
        snapshot
    }

    /// Fire-and-forget publish. Handlers are invoked in subscription
    /// order; synchronous handler bodies run inline, async continuations
    /// are driven on the runtime. Must be called from within a tokio
    /// runtime.
    pub fn publish(&self, event: LedgerEvent) {
        let topic = event.topic();
        for (id, handler) in self.snapshot(topic) {
            let future = handler(event.clone());
            let bus = self.clone();
            tokio::spawn(async move {
                if let Err(err) = future.await {
                    bus.republish_error(topic, id, err);
                }
            });
        }
    }

    /// Publish and sequentially await every handler before returning,
    /// guaranteeing all observers have fully processed the event.
    pub async fn publish_and_await(&self, event: LedgerEvent) {
        let topic = event.topic();
        for (id, handler) in self.snapshot(topic) {
            if let Err(err) = handler(event.clone()).await {
                self.republish_error(topic, id, err);
            }
        }
    }

    /// Resolve with the next event on `topic`, or time out.
    pub async fn wait_for(&self, topic: Topic, timeout: Option<Duration>) -> Result<LedgerEvent> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(tx)));
        self.once(
            topic,
            Arc::new(move |event| {
                let sender = sender.clone();
                Box::pin(async move {
                    if let Some(tx) = sender.lock().unwrap().take() {
                        let _ = tx.send(event);
                    }
                    Ok(())
                })
            }),
        );
        match timeout {
            Some(duration) => Ok(tokio::time::timeout(duration, rx).await??),
            None => Ok(rx.await?),
        }
    }

    fn republish_error(&self, source: Topic, handler_id: u64, err: anyhow::Error) {
        error!(?source, handler_id, error = %err, "event handler failed");
        // An error raised while handling the error topic itself is only
        // logged; republishing it would recurse.
        if source != Topic::Error {
            self.publish(LedgerEvent::Error {
                message: err.to_string(),
                source,
            });
        }
    }
}

fn wrap_sync<F>(f: F) -> Handler
where
    F: Fn(LedgerEvent) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |event| {
        let result = f(event);
        Box::pin(async move { result })
    })
}
