//! Strategy event emission

use crate::config::StrategyThresholds;
use crate::events::{topics, EventBus, EventPayload, PublishOutcome};
use crate::strategy::store::{AggregatedMetrics, StrategyMetricsStore};
use crate::strategy::{
    ExecutionContext, ExecutionRecord, Significance, StrategyFailureEvent,
    StrategyPerformanceEvent, StrategyThresholdEvent, ThresholdDirection, ThresholdMetric,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SOURCE: &str = "strategy-emitter";

/// Resources a strategy reports when it finishes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StrategyUsage {
    /// Model tokens consumed
    pub tokens_used: u64,
    /// Dollar cost
    pub cost: f64,
    /// Confidence in the result
    pub confidence: f64,
}

/// Publishes strategy outcomes and threshold crossings
pub struct StrategyEventEmitter {
    bus: Arc<EventBus>,
    store: Arc<StrategyMetricsStore>,
    thresholds: StrategyThresholds,
    /// Highest significance already reported per open breach
    breached: Mutex<HashMap<(String, ThresholdMetric), Significance>>,
}

impl StrategyEventEmitter {
    /// Create an emitter over a bus and an aggregate store
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<StrategyMetricsStore>,
        thresholds: StrategyThresholds,
    ) -> Self {
        Self {
            bus,
            store,
            thresholds,
            breached: Mutex::new(HashMap::new()),
        }
    }

    /// Aggregate store the emitter records into
    pub fn store(&self) -> &Arc<StrategyMetricsStore> {
        &self.store
    }

    /// Publish a success event
    pub async fn emit_strategy_performance(&self, event: StrategyPerformanceEvent) -> PublishOutcome {
        debug!(
            "Strategy {} succeeded in {}ms",
            event.strategy, event.duration_ms
        );
        self.bus
            .emit(
                topics::TOPIC_STRATEGY_SUCCESS,
                SOURCE,
                EventPayload::StrategyPerformance(event),
            )
            .await
    }

    /// Publish a failure event
    pub async fn emit_strategy_failure(&self, event: StrategyFailureEvent) -> PublishOutcome {
        debug!("Strategy {} failed: {}", event.strategy, event.error);
        self.bus
            .emit(
                topics::TOPIC_STRATEGY_FAILURE,
                SOURCE,
                EventPayload::StrategyFailure(event),
            )
            .await
    }

    /// Store a finished execution, publish its outcome and check thresholds
    pub async fn record_execution(&self, record: ExecutionRecord) -> AggregatedMetrics {
        let aggregate = self.store.record_execution(&record);

        let outcome = if record.success {
            self.emit_strategy_performance(record.performance_event()).await
        } else {
            self.emit_strategy_failure(record.failure_event()).await
        };
        if outcome == PublishOutcome::Dropped {
            warn!(
                "Outcome of execution {} was recorded but not published",
                record.execution_id
            );
        }

        self.check_thresholds(&aggregate, &record.strategy).await;
        aggregate
    }

    /// Compare an aggregate with the configured limits and publish new or
    /// worsened crossings. A metric back within its limit re-arms its alert.
    pub async fn check_thresholds(
        &self,
        aggregate: &AggregatedMetrics,
        strategy: &str,
    ) -> Vec<StrategyThresholdEvent> {
        if aggregate.count < self.thresholds.min_samples {
            return Vec::new();
        }

        let t = &self.thresholds;
        let checks = [
            (
                ThresholdMetric::SuccessRate,
                aggregate.success_rate(),
                t.min_success_rate,
                ThresholdDirection::Below,
            ),
            (
                ThresholdMetric::ExecutionTime,
                aggregate.avg_duration_ms,
                t.max_execution_time_ms,
                ThresholdDirection::Above,
            ),
            (
                ThresholdMetric::Confidence,
                aggregate.avg_confidence,
                t.min_confidence,
                ThresholdDirection::Below,
            ),
            (
                ThresholdMetric::Cost,
                aggregate.avg_cost,
                t.max_cost,
                ThresholdDirection::Above,
            ),
        ];

        let mut events = Vec::new();
        {
            let mut breached = self.breached.lock();
            for (metric, value, threshold, direction) in checks {
                let crossed = match direction {
                    ThresholdDirection::Below => value < threshold,
                    ThresholdDirection::Above => value > threshold,
                };
                let key = (strategy.to_string(), metric);

                if !crossed {
                    breached.remove(&key);
                    continue;
                }

                let significance = Significance::from_deviation(value, threshold);
                if breached.get(&key).is_some_and(|prev| *prev >= significance) {
                    continue;
                }
                breached.insert(key, significance);

                events.push(StrategyThresholdEvent {
                    strategy: strategy.to_string(),
                    metric,
                    value,
                    threshold,
                    direction,
                    significance,
                    sample_count: aggregate.count,
                    timestamp: Utc::now(),
                });
            }
        }

        for event in &events {
            info!(
                "Strategy {} {} {:?} threshold ({:.3} vs {:.3}, {:?})",
                event.strategy,
                event.metric,
                event.direction,
                event.value,
                event.threshold,
                event.significance
            );
            self.bus
                .emit(
                    topics::child(topics::TOPIC_STRATEGY_THRESHOLD_PREFIX, event.metric.as_str()),
                    SOURCE,
                    EventPayload::StrategyThreshold(event.clone()),
                )
                .await;
        }
        events
    }

    /// Start tracking one execution
    pub fn begin(
        self: &Arc<Self>,
        strategy: impl Into<String>,
        context: ExecutionContext,
    ) -> StrategyExecution {
        StrategyExecution {
            emitter: Arc::clone(self),
            execution_id: Uuid::new_v4().to_string(),
            strategy: strategy.into(),
            context,
            started: Instant::now(),
        }
    }
}

/// A pending execution; finishing it consumes the tracker, so each
/// execution produces exactly one outcome
pub struct StrategyExecution {
    emitter: Arc<StrategyEventEmitter>,
    execution_id: String,
    strategy: String,
    context: ExecutionContext,
    started: Instant,
}

impl StrategyExecution {
    /// Execution id
    pub fn id(&self) -> &str {
        &self.execution_id
    }

    /// Strategy identity
    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// Record success and publish a performance event
    pub async fn succeed(self, usage: StrategyUsage) -> AggregatedMetrics {
        self.finish(usage, None).await
    }

    /// Record failure and publish a failure event
    pub async fn fail(self, error: impl Into<String>, usage: StrategyUsage) -> AggregatedMetrics {
        self.finish(usage, Some(error.into())).await
    }

    async fn finish(self, usage: StrategyUsage, error: Option<String>) -> AggregatedMetrics {
        let record = ExecutionRecord {
            execution_id: self.execution_id,
            strategy: self.strategy,
            success: error.is_none(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            tokens_used: usage.tokens_used,
            cost: usage.cost,
            confidence: usage.confidence,
            error,
            context: self.context,
            timestamp: Utc::now(),
        };
        self.emitter.record_execution(record).await
    }
}
