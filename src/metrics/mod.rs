//! Resource metrics collection
//!
//! Turns raw execution outcomes into bounded metric histories and derived
//! signals (efficiency, health alerts, cost, bottlenecks). Recording never
//! fails the caller: bad samples are logged and skipped, alert publication
//! problems are logged.

/// Derived analyses over the raw histories
pub mod analysis;
/// Bounded sample buffers
pub mod history;
/// Periodic self-sampling
pub mod sampler;

pub use analysis::{
    Bottleneck, BottleneckSeverity, CostAnalysis, EfficiencySnapshot, ResourceKind,
    SavingsOpportunity,
};
pub use history::RingBuffer;

use crate::config::{Config, HealthThresholds};
use crate::events::{topics, EventBus, EventPayload, PublishOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Metric names recorded per execution
pub mod names {
    pub const EXECUTION_DURATION: &str = "execution_duration";
    pub const EXECUTION_COST: &str = "execution_cost";
    pub const MEMORY_USAGE: &str = "memory_usage";
    pub const TOKENS_USED: &str = "tokens_used";
    pub const API_CALLS: &str = "api_calls";
    pub const THROUGHPUT: &str = "throughput";
    pub const PROCESS_MEMORY: &str = "process_memory";
}

const SOURCE: &str = "resource-metrics";

/// Outcomes remembered for the rolling error rate
const OUTCOME_WINDOW: usize = 100;

/// Unit of a recorded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    /// Milliseconds
    Milliseconds,
    /// US dollars
    Dollars,
    /// Megabytes
    Megabytes,
    /// Model tokens
    Tokens,
    /// Plain count
    Count,
    /// Tokens per second
    TokensPerSecond,
    /// Dimensionless ratio
    Ratio,
}

/// One timestamped sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    /// Metric name
    pub name: String,
    /// Sample value
    pub value: f64,
    /// Unit of `value`
    pub unit: MetricUnit,
    /// Recording time
    pub timestamp: DateTime<Utc>,
    /// Pass-through context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Resources reported by one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionUsage {
    /// Dollar cost, when known
    pub cost: Option<f64>,
    /// Credits spent; converted to dollars when `cost` is absent
    pub credits: Option<f64>,
    /// Peak memory in megabytes
    pub memory_mb: Option<f64>,
    /// Memory allocated to the execution in megabytes
    pub memory_limit_mb: Option<f64>,
    /// Model tokens consumed
    pub tokens: u64,
    /// External API calls made
    pub api_calls: u64,
}

impl ExecutionUsage {
    /// Dollar cost, falling back to credits times the unit cost
    pub fn effective_cost(&self, credit_unit_cost: f64) -> f64 {
        self.cost
            .or_else(|| self.credits.map(|credits| credits * credit_unit_cost))
            .unwrap_or(0.0)
    }

    /// Memory used over memory allocated, when both are known
    pub fn memory_utilization(&self) -> Option<f64> {
        match (self.memory_mb, self.memory_limit_mb) {
            (Some(used), Some(limit)) if limit > 0.0 => Some(used / limit),
            _ => None,
        }
    }
}

/// Point-in-time service health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Share of time the service was usable
    pub availability: f64,
    /// Share of failed executions
    pub error_rate: f64,
    /// Share of capacity in use
    pub saturation: f64,
    /// Typical response time, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
}

impl HealthSnapshot {
    /// Snapshot taken now
    pub fn new(availability: f64, error_rate: f64, saturation: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            availability,
            error_rate,
            saturation,
            response_time_ms: None,
        }
    }
}

/// Health dimension that breached its threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Availability too low
    Availability,
    /// Error rate too high
    ErrorRate,
    /// Saturation too high
    Saturation,
}

impl AlertKind {
    /// Final topic segment
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Availability => "availability",
            AlertKind::ErrorRate => "error_rate",
            AlertKind::Saturation => "saturation",
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Breach within half the threshold
    Warning,
    /// Breach of half the threshold or more
    Critical,
}

/// Published on `resource/alert/<kind>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAlert {
    /// Alert id
    pub id: String,
    /// Dimension concerned
    pub kind: AlertKind,
    /// Severity
    pub severity: AlertSeverity,
    /// Observed value
    pub value: f64,
    /// Configured threshold
    pub threshold: f64,
    /// Human readable summary
    pub message: String,
    /// Alert time
    pub timestamp: DateTime<Utc>,
}

impl ResourceAlert {
    fn new(kind: AlertKind, value: f64, threshold: f64) -> Self {
        let deviation = if threshold > 0.0 {
            (value - threshold).abs() / threshold
        } else {
            1.0
        };
        let severity = if deviation >= 0.5 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            value,
            threshold,
            message: format!(
                "{} at {:.3} breached threshold {:.3}",
                kind.as_str(),
                value,
                threshold
            ),
            timestamp: Utc::now(),
        }
    }

    /// Topic the alert is published on
    pub fn topic(&self) -> String {
        topics::child(topics::TOPIC_RESOURCE_ALERT_PREFIX, self.kind.as_str())
    }
}

/// Collector settings
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Samples kept per metric name
    pub history_capacity: usize,
    /// Health snapshots kept
    pub health_capacity: usize,
    /// Self-sampling period
    pub sample_interval: Duration,
    /// Dollar value of one credit
    pub credit_unit_cost: f64,
    /// Cost per execution considered fully efficient
    pub cost_budget: f64,
    /// Duration per execution considered fully efficient
    pub target_duration_ms: u64,
    /// Alert thresholds
    pub health_thresholds: HealthThresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig::from(&Config::default())
    }
}

impl From<&Config> for MetricsConfig {
    fn from(config: &Config) -> Self {
        Self {
            history_capacity: config.metrics_history_capacity,
            health_capacity: config.health_history_capacity,
            sample_interval: Duration::from_secs(config.self_sample_interval_secs),
            credit_unit_cost: config.credit_unit_cost,
            cost_budget: config.cost_budget_per_execution,
            target_duration_ms: config.target_duration_ms,
            health_thresholds: config.health_thresholds,
        }
    }
}

struct State {
    metrics: HashMap<String, RingBuffer<PerformanceMetric>>,
    efficiency: RingBuffer<EfficiencySnapshot>,
    health: RingBuffer<HealthSnapshot>,
    utilization: HashMap<ResourceKind, f64>,
    outcomes: RingBuffer<bool>,
}

impl State {
    fn push_metric(
        &mut self,
        capacity: usize,
        name: &str,
        value: f64,
        unit: MetricUnit,
        metadata: Option<Map<String, Value>>,
    ) {
        if !value.is_finite() {
            warn!("Skipping non-finite sample for metric {}", name);
            return;
        }
        let history = self
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| RingBuffer::new(capacity));
        history.push(PerformanceMetric {
            name: name.to_string(),
            value,
            unit,
            timestamp: Utc::now(),
            metadata,
        });
    }
}

/// Records execution samples and derives aggregate signals
pub struct ResourceMetricsCollector {
    config: MetricsConfig,
    bus: Option<Arc<EventBus>>,
    state: Mutex<State>,
    sampler: Mutex<Option<sampler::SamplerHandle>>,
}

impl ResourceMetricsCollector {
    /// Create a collector; alerts are published on `bus` when given
    pub fn new(config: MetricsConfig, bus: Option<Arc<EventBus>>) -> Self {
        let state = State {
            metrics: HashMap::new(),
            efficiency: RingBuffer::new(config.history_capacity),
            health: RingBuffer::new(config.health_capacity),
            utilization: HashMap::new(),
            outcomes: RingBuffer::new(OUTCOME_WINDOW),
        };
        Self {
            config,
            bus,
            state: Mutex::new(state),
            sampler: Mutex::new(None),
        }
    }

    /// Collector settings
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Append one sample, evicting the oldest past capacity
    pub fn record_metric(
        &self,
        name: &str,
        value: f64,
        unit: MetricUnit,
        metadata: Option<Map<String, Value>>,
    ) {
        self.state
            .lock()
            .push_metric(self.config.history_capacity, name, value, unit, metadata);
    }

    /// Record the metric bundle and efficiency snapshot for one execution
    pub fn record_execution(
        &self,
        usage: &ExecutionUsage,
        duration_ms: u64,
        success: bool,
    ) -> EfficiencySnapshot {
        let capacity = self.config.history_capacity;
        let cost = usage.effective_cost(self.config.credit_unit_cost);
        let memory_utilization = usage.memory_utilization();
        let snapshot = EfficiencySnapshot::derive(
            memory_utilization.unwrap_or(1.0),
            cost,
            self.config.cost_budget,
            duration_ms,
            self.config.target_duration_ms,
            success,
        );

        let mut outcome = Map::new();
        outcome.insert("success".to_string(), Value::Bool(success));

        let mut state = self.state.lock();
        state.push_metric(
            capacity,
            names::EXECUTION_DURATION,
            duration_ms as f64,
            MetricUnit::Milliseconds,
            Some(outcome),
        );
        state.push_metric(capacity, names::EXECUTION_COST, cost, MetricUnit::Dollars, None);
        if let Some(memory) = usage.memory_mb {
            state.push_metric(capacity, names::MEMORY_USAGE, memory, MetricUnit::Megabytes, None);
        }
        state.push_metric(
            capacity,
            names::TOKENS_USED,
            usage.tokens as f64,
            MetricUnit::Tokens,
            None,
        );
        state.push_metric(
            capacity,
            names::API_CALLS,
            usage.api_calls as f64,
            MetricUnit::Count,
            None,
        );
        if duration_ms > 0 {
            state.push_metric(
                capacity,
                names::THROUGHPUT,
                usage.tokens as f64 / (duration_ms as f64 / 1000.0),
                MetricUnit::TokensPerSecond,
                None,
            );
        }
        if let Some(ratio) = memory_utilization {
            state.utilization.insert(ResourceKind::Memory, ratio);
        }
        state.efficiency.push(snapshot.clone());
        state.outcomes.push(success);

        debug!(
            "Recorded execution: {}ms, ${:.5}, success={}",
            duration_ms, cost, success
        );
        snapshot
    }

    /// Append a health snapshot and publish alerts for breached thresholds
    pub async fn record_health(&self, snapshot: HealthSnapshot) -> Vec<ResourceAlert> {
        let thresholds = self.config.health_thresholds;
        let mut alerts = Vec::new();

        if snapshot.availability < thresholds.min_availability {
            alerts.push(ResourceAlert::new(
                AlertKind::Availability,
                snapshot.availability,
                thresholds.min_availability,
            ));
        }
        if snapshot.error_rate > thresholds.max_error_rate {
            alerts.push(ResourceAlert::new(
                AlertKind::ErrorRate,
                snapshot.error_rate,
                thresholds.max_error_rate,
            ));
        }
        if snapshot.saturation > thresholds.max_saturation {
            alerts.push(ResourceAlert::new(
                AlertKind::Saturation,
                snapshot.saturation,
                thresholds.max_saturation,
            ));
        }

        self.state.lock().health.push(snapshot);

        for alert in &alerts {
            warn!("Health alert: {}", alert.message);
            self.publish_alert(alert).await;
        }
        alerts
    }

    async fn publish_alert(&self, alert: &ResourceAlert) {
        let Some(bus) = &self.bus else {
            return;
        };
        let outcome = bus
            .emit(
                alert.topic(),
                SOURCE,
                EventPayload::ResourceAlert(alert.clone()),
            )
            .await;
        if outcome == PublishOutcome::Dropped {
            warn!("Alert {} was not delivered: event bus stopped", alert.id);
        }
    }

    /// Set the latest utilization ratio for a resource
    pub fn record_utilization(&self, resource: ResourceKind, utilization: f64) {
        if !utilization.is_finite() || utilization < 0.0 {
            warn!("Ignoring invalid {} utilization {}", resource, utilization);
            return;
        }
        self.state.lock().utilization.insert(resource, utilization);
    }

    /// Cost totals, trend, projection and savings suggestions
    pub fn get_cost_analysis(&self) -> CostAnalysis {
        let state = self.state.lock();

        let (total_cost, window) = match state.metrics.get(names::EXECUTION_COST) {
            Some(history) => (
                history.iter().map(|m| m.value).sum(),
                history
                    .last_n(analysis::TREND_WINDOW)
                    .map(|m| (m.timestamp, m.value))
                    .collect::<Vec<_>>(),
            ),
            None => (0.0, Vec::new()),
        };

        let trend: Vec<f64> = window.iter().map(|(_, cost)| *cost).collect();
        let average_cost = mean(trend.iter().copied()).unwrap_or(0.0);
        let projected_monthly_cost = analysis::project_monthly(&window);

        let recent: Vec<&EfficiencySnapshot> =
            state.efficiency.last_n(analysis::TREND_WINDOW).collect();
        let avg_efficiency = mean(recent.iter().map(|s| s.overall));
        let avg_waste = mean(recent.iter().map(|s| s.waste));

        CostAnalysis {
            total_cost,
            trend,
            average_cost,
            projected_monthly_cost,
            opportunities: analysis::savings_opportunities(
                avg_efficiency,
                avg_waste,
                projected_monthly_cost,
            ),
        }
    }

    /// Resources above the low severity band, most severe first
    pub fn detect_bottlenecks(&self) -> Vec<Bottleneck> {
        let state = self.state.lock();
        let mut bottlenecks: Vec<Bottleneck> = state
            .utilization
            .iter()
            .filter_map(|(resource, utilization)| Bottleneck::detect(*resource, *utilization))
            .collect();
        bottlenecks.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.resource.cmp(&b.resource))
        });
        bottlenecks
    }

    /// Stored samples for a metric, oldest first
    pub fn get_metrics(&self, name: &str) -> Vec<PerformanceMetric> {
        self.state
            .lock()
            .metrics
            .get(name)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of every metric with samples
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().metrics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Most recent efficiency snapshot
    pub fn latest_efficiency(&self) -> Option<EfficiencySnapshot> {
        self.state.lock().efficiency.latest().cloned()
    }

    /// Stored health snapshots, oldest first
    pub fn health_history(&self) -> Vec<HealthSnapshot> {
        self.state.lock().health.iter().cloned().collect()
    }

    /// Latest utilization for a resource
    pub fn utilization(&self, resource: ResourceKind) -> Option<f64> {
        self.state.lock().utilization.get(&resource).copied()
    }

    /// Failed share of recent executions
    pub fn error_rate(&self) -> f64 {
        let state = self.state.lock();
        if state.outcomes.is_empty() {
            return 0.0;
        }
        let failures = state.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / state.outcomes.len() as f64
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
