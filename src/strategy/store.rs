//! Running strategy aggregates

use crate::strategy::ExecutionRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Running totals updated in O(1) per record
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    /// Executions recorded
    pub count: u64,
    /// Successful executions
    pub success_count: u64,
    /// Mean duration in milliseconds
    pub avg_duration_ms: f64,
    /// Mean confidence
    pub avg_confidence: f64,
    /// Mean dollar cost
    pub avg_cost: f64,
    /// Mean tokens
    pub avg_tokens: f64,
}

impl AggregatedMetrics {
    /// Fold one record into the running means
    pub fn update(&mut self, record: &ExecutionRecord) {
        self.count += 1;
        if record.success {
            self.success_count += 1;
        }
        let n = self.count as f64;
        self.avg_duration_ms += (record.duration_ms as f64 - self.avg_duration_ms) / n;
        self.avg_confidence += (record.confidence - self.avg_confidence) / n;
        self.avg_cost += (record.cost - self.avg_cost) / n;
        self.avg_tokens += (record.tokens_used as f64 - self.avg_tokens) / n;
    }

    /// Successful share, zero before any record
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.count as f64
        }
    }
}

#[derive(Default)]
struct Aggregates {
    overall: AggregatedMetrics,
    by_strategy: HashMap<String, AggregatedMetrics>,
}

/// In-memory aggregate store, overall and per strategy
#[derive(Default)]
pub struct StrategyMetricsStore {
    aggregates: RwLock<Aggregates>,
}

impl StrategyMetricsStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record in; returns the strategy's updated aggregate
    pub fn record_execution(&self, record: &ExecutionRecord) -> AggregatedMetrics {
        let mut aggregates = self.aggregates.write();
        aggregates.overall.update(record);
        let entry = aggregates
            .by_strategy
            .entry(record.strategy.clone())
            .or_default();
        entry.update(record);
        *entry
    }

    /// Aggregate over every strategy
    pub fn aggregated_metrics(&self) -> AggregatedMetrics {
        self.aggregates.read().overall
    }

    /// Aggregate for one strategy
    pub fn metrics_for(&self, strategy: &str) -> Option<AggregatedMetrics> {
        self.aggregates.read().by_strategy.get(strategy).copied()
    }

    /// Strategies with at least one record
    pub fn strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.aggregates.read().by_strategy.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ExecutionContext;
    use chrono::Utc;

    fn record(strategy: &str, success: bool, duration_ms: u64, cost: f64) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: "exec".to_string(),
            strategy: strategy.to_string(),
            success,
            duration_ms,
            tokens_used: 100,
            cost,
            confidence: if success { 0.9 } else { 0.3 },
            error: None,
            context: ExecutionContext::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_running_means() {
        let store = StrategyMetricsStore::new();
        store.record_execution(&record("reasoning", true, 100, 0.02));
        store.record_execution(&record("reasoning", false, 300, 0.04));

        let metrics = store.metrics_for("reasoning").unwrap();
        assert_eq!(metrics.count, 2);
        assert_eq!(metrics.success_count, 1);
        assert!((metrics.avg_duration_ms - 200.0).abs() < 1e-9);
        assert!((metrics.avg_cost - 0.03).abs() < 1e-9);
        assert!((metrics.avg_confidence - 0.6).abs() < 1e-9);
        assert!((metrics.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_overall_spans_strategies() {
        let store = StrategyMetricsStore::new();
        store.record_execution(&record("a", true, 10, 0.0));
        store.record_execution(&record("b", true, 30, 0.0));

        assert_eq!(store.aggregated_metrics().count, 2);
        assert_eq!(store.strategies(), vec!["a".to_string(), "b".to_string()]);
        assert!(store.metrics_for("c").is_none());
    }
}
