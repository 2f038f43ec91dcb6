//! In-process publish/subscribe bus
//!
//! Every subscriber owns an unbounded channel drained by its own delivery
//! task, so one subscriber sees events in publish order and a slow or failing
//! handler never holds up the publisher or other subscribers.

/// Topic pattern parsing and matching
pub mod topic;
/// Canonical topic names
pub mod topics;

pub use topic::TopicPattern;

use crate::metrics::ResourceAlert;
use crate::strategy::learning::OptimizationSuggestion;
use crate::strategy::{StrategyFailureEvent, StrategyPerformanceEvent, StrategyThresholdEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Typed event body, one variant per event family
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A strategy execution succeeded
    StrategyPerformance(StrategyPerformanceEvent),
    /// A strategy execution failed
    StrategyFailure(StrategyFailureEvent),
    /// An aggregate strategy metric crossed its threshold
    StrategyThreshold(StrategyThresholdEvent),
    /// A health threshold was breached
    ResourceAlert(ResourceAlert),
    /// A learning agent proposes a change
    OptimizationSuggestion(OptimizationSuggestion),
    /// Free-form JSON body
    Custom(Map<String, Value>),
}

impl EventPayload {
    /// Stable name used for per-type counters
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::StrategyPerformance(_) => "strategy_performance",
            EventPayload::StrategyFailure(_) => "strategy_failure",
            EventPayload::StrategyThreshold(_) => "strategy_threshold",
            EventPayload::ResourceAlert(_) => "resource_alert",
            EventPayload::OptimizationSuggestion(_) => "optimization_suggestion",
            EventPayload::Custom(_) => "custom",
        }
    }
}

/// Event envelope delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Unique event id
    pub id: String,
    /// Concrete topic the event was published on
    pub topic: String,
    /// Component that produced the event
    pub source: String,
    /// Publication time
    pub timestamp: DateTime<Utc>,
    /// Event body
    pub payload: EventPayload,
}

impl BusEvent {
    /// Create an event stamped with a fresh id and the current time
    pub fn new(topic: impl Into<String>, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Receives events for a subscription
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event; errors are logged by the bus
    async fn handle(&self, event: Arc<BusEvent>) -> crate::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<BusEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<BusEvent>) -> crate::Result<()> {
        (self.0)(event).await
    }
}

/// Registration request
pub struct Subscription {
    /// Unique subscription id; re-using an id replaces the old subscription
    pub id: String,
    /// Topic pattern
    pub pattern: String,
    /// Handler invoked for matching events
    pub handler: Arc<dyn EventHandler>,
}

/// Result of a publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Queued for this many matching subscribers
    Delivered(usize),
    /// The bus is stopped; the event was discarded
    Dropped,
}

/// Bus self-observability counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusMetrics {
    /// Events accepted while running
    pub total_events: u64,
    /// Currently registered subscriptions
    pub active_subscriptions: usize,
    /// Events discarded because the bus was stopped
    pub dropped_events: u64,
    /// Handler invocations that returned an error or panicked
    pub handler_errors: u64,
    /// Accepted events per payload kind
    pub events_by_type: HashMap<String, u64>,
}

#[derive(Default)]
struct Counters {
    total_events: u64,
    dropped_events: u64,
    events_by_type: HashMap<String, u64>,
}

struct Subscriber {
    id: String,
    pattern: TopicPattern,
    tx: mpsc::UnboundedSender<Arc<BusEvent>>,
    task: JoinHandle<()>,
}

/// Topic-based publish/subscribe bus
pub struct EventBus {
    running: AtomicBool,
    subscribers: RwLock<Vec<Subscriber>>,
    counters: Mutex<Counters>,
    handler_errors: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a stopped bus; call [`EventBus::start`] before publishing
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            subscribers: RwLock::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
            handler_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Begin accepting events
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Event bus started");
        }
    }

    /// Stop accepting events; already queued deliveries still run
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Event bus stopped");
        }
    }

    /// Whether the bus accepts events
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a handler for a topic pattern
    pub async fn subscribe(&self, subscription: Subscription) -> crate::Result<()> {
        let pattern = TopicPattern::parse(&subscription.pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(
            subscription.id.clone(),
            rx,
            subscription.handler,
            Arc::clone(&self.handler_errors),
        ));

        let replaced = {
            let mut subscribers = self.subscribers.write();
            let existing = subscribers.iter().position(|s| s.id == subscription.id);
            let replaced = existing.map(|idx| subscribers.remove(idx));
            subscribers.push(Subscriber {
                id: subscription.id.clone(),
                pattern,
                tx,
                task,
            });
            replaced
        };

        if replaced.is_some() {
            debug!("Subscription {} replaced", subscription.id);
        }
        debug!(
            "Subscription {} registered for {}",
            subscription.id, subscription.pattern
        );
        Ok(())
    }

    /// Register an async closure for a topic pattern
    pub async fn subscribe_fn<F, Fut>(
        &self,
        id: impl Into<String>,
        pattern: impl Into<String>,
        f: F,
    ) -> crate::Result<()>
    where
        F: Fn(Arc<BusEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        self.subscribe(Subscription {
            id: id.into(),
            pattern: pattern.into(),
            handler: Arc::new(FnHandler(f)),
        })
        .await
    }

    /// Remove a subscription; queued events for it are still delivered
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.iter().position(|s| s.id == id) {
            Some(idx) => {
                subscribers.remove(idx);
                debug!("Subscription {} removed", id);
                true
            }
            None => false,
        }
    }

    /// Queue an event for every matching subscriber
    pub async fn publish(&self, event: BusEvent) -> PublishOutcome {
        if !self.is_running() {
            self.counters.lock().dropped_events += 1;
            warn!(
                "Event bus is stopped, dropping {} event on {}",
                event.payload.kind(),
                event.topic
            );
            return PublishOutcome::Dropped;
        }

        {
            let mut counters = self.counters.lock();
            counters.total_events += 1;
            *counters
                .events_by_type
                .entry(event.payload.kind().to_string())
                .or_insert(0) += 1;
        }

        let event = Arc::new(event);
        let subscribers = self.subscribers.read();
        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.pattern.matches(&event.topic)) {
            if subscriber.tx.send(Arc::clone(&event)).is_ok() {
                delivered += 1;
            } else {
                warn!("Subscription {} is no longer receiving", subscriber.id);
            }
        }

        debug!("Event {} on {} queued for {} subscribers", event.id, event.topic, delivered);
        PublishOutcome::Delivered(delivered)
    }

    /// Build and publish an event
    pub async fn emit(
        &self,
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: EventPayload,
    ) -> PublishOutcome {
        self.publish(BusEvent::new(topic, source, payload)).await
    }

    /// Current counters
    pub fn metrics(&self) -> BusMetrics {
        let counters = self.counters.lock();
        BusMetrics {
            total_events: counters.total_events,
            active_subscriptions: self.subscribers.read().len(),
            dropped_events: counters.dropped_events,
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            events_by_type: counters.events_by_type.clone(),
        }
    }

    /// Stop the bus, drop every subscription and wait for pending deliveries
    pub async fn close(&self) {
        self.stop();
        let drained: Vec<Subscriber> = self.subscribers.write().drain(..).collect();
        for subscriber in drained {
            drop(subscriber.tx);
            if let Err(e) = subscriber.task.await {
                warn!("Delivery task for {} ended abnormally: {}", subscriber.id, e);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(
    id: String,
    mut rx: mpsc::UnboundedReceiver<Arc<BusEvent>>,
    handler: Arc<dyn EventHandler>,
    handler_errors: Arc<AtomicU64>,
) {
    while let Some(event) = rx.recv().await {
        let result = AssertUnwindSafe(handler.handle(Arc::clone(&event)))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                handler_errors.fetch_add(1, Ordering::Relaxed);
                error!("Handler {} failed on {}: {}", id, event.topic, e);
            }
            Err(_) => {
                handler_errors.fetch_add(1, Ordering::Relaxed);
                error!("Handler {} panicked on {}", id, event.topic);
            }
        }
    }
    debug!("Delivery task for {} finished", id);
}
