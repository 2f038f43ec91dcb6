//! Strategy execution tracking
//!
//! Execution outcomes are folded into running aggregates and published as
//! immutable events, so learning agents can react without the executing
//! strategy knowing about them.

/// Event emission and threshold checks
pub mod emitter;
/// Learning agent reacting to strategy events
pub mod learning;
/// Running aggregates
pub mod store;

pub use emitter::{StrategyEventEmitter, StrategyExecution};
pub use store::{AggregatedMetrics, StrategyMetricsStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Where an execution ran
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionContext {
    /// Run or swarm the execution belonged to
    pub run_id: Option<String>,
    /// Step within the run
    pub step_id: Option<String>,
    /// Requesting user
    pub user_id: Option<String>,
    /// Pass-through context
    pub metadata: Map<String, Value>,
}

/// One finished strategy execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Execution id
    pub execution_id: String,
    /// Strategy identity
    pub strategy: String,
    /// Whether the execution succeeded
    pub success: bool,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Model tokens consumed
    pub tokens_used: u64,
    /// Dollar cost
    pub cost: f64,
    /// Strategy's confidence in its result, `[0, 1]`
    pub confidence: f64,
    /// Failure reason
    pub error: Option<String>,
    /// Execution context
    pub context: ExecutionContext,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

/// Published on `strategy/performance/success`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPerformanceEvent {
    /// Execution id
    pub execution_id: String,
    /// Strategy identity
    pub strategy: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Model tokens consumed
    pub tokens_used: u64,
    /// Dollar cost
    pub cost: f64,
    /// Confidence in the result
    pub confidence: f64,
    /// Execution context
    pub context: ExecutionContext,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

/// Published on `strategy/performance/failure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyFailureEvent {
    /// Execution id
    pub execution_id: String,
    /// Strategy identity
    pub strategy: String,
    /// Failure reason
    pub error: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Model tokens consumed before failing
    pub tokens_used: u64,
    /// Dollar cost incurred
    pub cost: f64,
    /// Execution context
    pub context: ExecutionContext,
    /// Failure time
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Performance event for a successful record
    pub fn performance_event(&self) -> StrategyPerformanceEvent {
        StrategyPerformanceEvent {
            execution_id: self.execution_id.clone(),
            strategy: self.strategy.clone(),
            duration_ms: self.duration_ms,
            tokens_used: self.tokens_used,
            cost: self.cost,
            confidence: self.confidence,
            context: self.context.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Failure event for a failed record
    pub fn failure_event(&self) -> StrategyFailureEvent {
        StrategyFailureEvent {
            execution_id: self.execution_id.clone(),
            strategy: self.strategy.clone(),
            error: self
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            duration_ms: self.duration_ms,
            tokens_used: self.tokens_used,
            cost: self.cost,
            context: self.context.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Aggregate metric compared against a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMetric {
    /// Share of successful executions
    SuccessRate,
    /// Average duration
    ExecutionTime,
    /// Average confidence
    Confidence,
    /// Average cost
    Cost,
}

impl ThresholdMetric {
    /// Final topic segment
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdMetric::SuccessRate => "success_rate",
            ThresholdMetric::ExecutionTime => "execution_time",
            ThresholdMetric::Confidence => "confidence",
            ThresholdMetric::Cost => "cost",
        }
    }
}

impl fmt::Display for ThresholdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of the threshold the value is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    /// Value exceeds a maximum
    Above,
    /// Value falls short of a minimum
    Below,
}

/// How far past the threshold the value is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    /// Less than 10% past the threshold
    Low,
    /// 10% to 25% past the threshold
    Medium,
    /// 25% or more past the threshold
    High,
}

impl Significance {
    /// Classify the relative deviation from a threshold
    pub fn from_deviation(value: f64, threshold: f64) -> Self {
        let deviation = if threshold.abs() > f64::EPSILON {
            (value - threshold).abs() / threshold.abs()
        } else {
            f64::INFINITY
        };
        if deviation < 0.1 {
            Significance::Low
        } else if deviation < 0.25 {
            Significance::Medium
        } else {
            Significance::High
        }
    }
}

/// Published on `strategy/threshold/<metric>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyThresholdEvent {
    /// Strategy identity
    pub strategy: String,
    /// Metric that crossed
    pub metric: ThresholdMetric,
    /// Current aggregate value
    pub value: f64,
    /// Configured threshold
    pub threshold: f64,
    /// Side of the threshold
    pub direction: ThresholdDirection,
    /// Distance past the threshold
    pub significance: Significance,
    /// Executions behind the aggregate
    pub sample_count: u64,
    /// Detection time
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significance_bands() {
        assert_eq!(Significance::from_deviation(0.75, 0.8), Significance::Low);
        assert_eq!(Significance::from_deviation(0.7, 0.8), Significance::Medium);
        assert_eq!(Significance::from_deviation(0.4, 0.8), Significance::High);
    }
}
