//! Learning agent that turns strategy events into optimization suggestions

use crate::events::{topics, BusEvent, EventBus, EventHandler, EventPayload, Subscription};
use crate::strategy::{Significance, StrategyThresholdEvent, ThresholdMetric};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const SOURCE: &str = "performance-learning-agent";

/// How quickly a suggestion should be acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// Sustained degradation
    Routine,
    /// A metric is far past its threshold
    Urgent,
}

/// Proposed change for a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSuggestion {
    /// Suggestion id
    pub id: String,
    /// Strategy the suggestion is about
    pub strategy: String,
    /// How quickly to act
    pub urgency: Urgency,
    /// What was observed
    pub reason: String,
    /// What to change
    pub recommendation: String,
    /// Numbers behind the observation
    pub evidence: Map<String, Value>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

/// Tuning for [`PerformanceLearningAgent`]
#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Recent outcomes kept per strategy
    pub window_size: usize,
    /// Failure share in the window that triggers a suggestion
    pub max_failure_rate: f64,
    /// Outcomes needed before the window is judged
    pub min_samples: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            max_failure_rate: 0.3,
            min_samples: 5,
        }
    }
}

/// Subscribes to strategy events and publishes suggestions
pub struct PerformanceLearningAgent {
    bus: Arc<EventBus>,
    config: LearningConfig,
    windows: Mutex<HashMap<String, VecDeque<bool>>>,
    suggestions: AtomicU64,
}

impl PerformanceLearningAgent {
    /// Create an agent; it observes nothing until [`attach`](Self::attach)
    pub fn new(bus: Arc<EventBus>, config: LearningConfig) -> Self {
        Self {
            bus,
            config,
            windows: Mutex::new(HashMap::new()),
            suggestions: AtomicU64::new(0),
        }
    }

    /// Subscribe to performance and threshold topics
    pub async fn attach(self: Arc<Self>) -> crate::Result<()> {
        let bus = Arc::clone(&self.bus);
        bus.subscribe(Subscription {
            id: format!("{}/performance", SOURCE),
            pattern: topics::PATTERN_STRATEGY_PERFORMANCE.to_string(),
            handler: self.clone(),
        })
        .await?;
        bus.subscribe(Subscription {
            id: format!("{}/threshold", SOURCE),
            pattern: topics::PATTERN_STRATEGY_THRESHOLD.to_string(),
            handler: self,
        })
        .await?;
        info!("Performance learning agent attached");
        Ok(())
    }

    /// Suggestions published so far
    pub fn suggestions_issued(&self) -> u64 {
        self.suggestions.load(Ordering::Relaxed)
    }

    /// Push an outcome; returns the failure rate when the window trips
    fn observe(&self, strategy: &str, success: bool) -> Option<(f64, usize)> {
        let mut windows = self.windows.lock();
        let window = windows.entry(strategy.to_string()).or_default();
        window.push_back(success);
        while window.len() > self.config.window_size.max(1) {
            window.pop_front();
        }

        if window.len() < self.config.min_samples {
            return None;
        }
        let failures = window.iter().filter(|ok| !**ok).count();
        let rate = failures as f64 / window.len() as f64;
        if rate > self.config.max_failure_rate {
            let samples = window.len();
            window.clear();
            Some((rate, samples))
        } else {
            None
        }
    }

    async fn publish(&self, suggestion: OptimizationSuggestion) {
        let topic = match suggestion.urgency {
            Urgency::Urgent => topics::TOPIC_SUGGESTION_URGENT,
            Urgency::Routine => topics::TOPIC_SUGGESTION_ROUTINE,
        };
        info!(
            "Suggesting change for {}: {}",
            suggestion.strategy, suggestion.recommendation
        );
        self.suggestions.fetch_add(1, Ordering::Relaxed);
        self.bus
            .emit(topic, SOURCE, EventPayload::OptimizationSuggestion(suggestion))
            .await;
    }
}

fn recommendation_for(metric: ThresholdMetric) -> &'static str {
    match metric {
        ThresholdMetric::SuccessRate => "fall back to a more reliable strategy",
        ThresholdMetric::ExecutionTime => "reduce step count or switch to a faster model",
        ThresholdMetric::Confidence => "add verification steps or a stronger model",
        ThresholdMetric::Cost => "route to a cheaper model or trim prompt context",
    }
}

fn threshold_suggestion(event: &StrategyThresholdEvent) -> OptimizationSuggestion {
    let mut evidence = Map::new();
    evidence.insert("metric".to_string(), json!(event.metric.as_str()));
    evidence.insert("value".to_string(), json!(event.value));
    evidence.insert("threshold".to_string(), json!(event.threshold));
    evidence.insert("sampleCount".to_string(), json!(event.sample_count));

    OptimizationSuggestion {
        id: Uuid::new_v4().to_string(),
        strategy: event.strategy.clone(),
        urgency: Urgency::Urgent,
        reason: format!(
            "{} is {:?} its threshold ({:.3} vs {:.3})",
            event.metric, event.direction, event.value, event.threshold
        ),
        recommendation: recommendation_for(event.metric).to_string(),
        evidence,
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl EventHandler for PerformanceLearningAgent {
    async fn handle(&self, event: Arc<BusEvent>) -> crate::Result<()> {
        let (strategy, success) = match &event.payload {
            EventPayload::StrategyThreshold(threshold) => {
                if threshold.significance == Significance::High {
                    self.publish(threshold_suggestion(threshold)).await;
                }
                return Ok(());
            }
            EventPayload::StrategyPerformance(e) => (e.strategy.as_str(), true),
            EventPayload::StrategyFailure(e) => (e.strategy.as_str(), false),
            other => {
                debug!("Learning agent ignoring {} event", other.kind());
                return Ok(());
            }
        };

        if let Some((rate, samples)) = self.observe(strategy, success) {
            let mut evidence = Map::new();
            evidence.insert("failureRate".to_string(), json!(rate));
            evidence.insert("samples".to_string(), json!(samples));

            self.publish(OptimizationSuggestion {
                id: Uuid::new_v4().to_string(),
                strategy: strategy.to_string(),
                urgency: Urgency::Routine,
                reason: format!(
                    "{:.0}% of the last {} executions failed",
                    rate * 100.0,
                    samples
                ),
                recommendation: "review recent failures and adjust strategy parameters"
                    .to_string(),
                evidence,
                timestamp: Utc::now(),
            })
            .await;
        }
        Ok(())
    }
}
