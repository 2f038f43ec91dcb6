//! Derived analyses
//!
//! Everything here is recomputed from raw histories on demand. Cost
//! projections are best-effort heuristics, not forecasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Samples used for cost trends and moving averages
pub const TREND_WINDOW: usize = 30;

const MS_PER_DAY: f64 = 86_400_000.0;
const DAYS_PER_MONTH: f64 = 30.0;

/// Efficiency below this suggests improving utilization
pub const LOW_EFFICIENCY: f64 = 0.7;
/// Waste above this suggests reducing waste
pub const HIGH_WASTE: f64 = 0.2;

/// Resource categories tracked for bottlenecks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Processor time
    Cpu,
    /// Process or system memory
    Memory,
    /// Network bandwidth / external API capacity
    Network,
    /// Disk
    Storage,
    /// Worker slots
    Concurrency,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "CPU"),
            ResourceKind::Memory => write!(f, "Memory"),
            ResourceKind::Network => write!(f, "Network"),
            ResourceKind::Storage => write!(f, "Storage"),
            ResourceKind::Concurrency => write!(f, "Concurrency"),
        }
    }
}

/// Bottleneck severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckSeverity {
    /// Below 0.5 utilization
    Low,
    /// 0.5 up to 0.7
    Medium,
    /// 0.7 up to 0.9
    High,
    /// 0.9 and above
    Critical,
}

impl BottleneckSeverity {
    /// Classify a utilization ratio
    pub fn classify(utilization: f64) -> Self {
        if utilization < 0.5 {
            BottleneckSeverity::Low
        } else if utilization < 0.7 {
            BottleneckSeverity::Medium
        } else if utilization < 0.9 {
            BottleneckSeverity::High
        } else {
            BottleneckSeverity::Critical
        }
    }
}

/// A resource running hot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    /// Resource concerned
    pub resource: ResourceKind,
    /// Latest utilization ratio
    pub utilization: f64,
    /// Classified severity, never `Low`
    pub severity: BottleneckSeverity,
    /// Suggested action
    pub recommendation: String,
}

impl Bottleneck {
    /// Build a bottleneck if the utilization is above the low band
    pub fn detect(resource: ResourceKind, utilization: f64) -> Option<Self> {
        let severity = BottleneckSeverity::classify(utilization);
        if severity == BottleneckSeverity::Low {
            return None;
        }
        let recommendation = match severity {
            BottleneckSeverity::Critical => format!("Scale {} capacity immediately", resource),
            BottleneckSeverity::High => format!("Plan additional {} capacity", resource),
            _ => format!("Monitor {} utilization", resource),
        };
        Some(Self {
            resource,
            utilization,
            severity,
            recommendation,
        })
    }
}

/// Efficiency of one execution, all ratios in `[0, 1]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencySnapshot {
    /// When the execution finished
    pub timestamp: DateTime<Utc>,
    /// Used / allocated resources
    pub resource_utilization: f64,
    /// Budget relative to actual cost
    pub cost_efficiency: f64,
    /// Target duration relative to actual duration
    pub time_efficiency: f64,
    /// Mean of the three ratios, zero for failed executions
    pub overall: f64,
    /// Share of resources that produced nothing
    pub waste: f64,
}

impl EfficiencySnapshot {
    /// Derive the snapshot for one execution
    pub fn derive(
        utilization: f64,
        cost: f64,
        cost_budget: f64,
        duration_ms: u64,
        target_duration_ms: u64,
        success: bool,
    ) -> Self {
        let resource_utilization = utilization.clamp(0.0, 1.0);
        let cost_efficiency = if cost <= 0.0 {
            1.0
        } else {
            (cost_budget / cost).min(1.0)
        };
        let time_efficiency = if duration_ms == 0 || duration_ms <= target_duration_ms {
            1.0
        } else {
            target_duration_ms as f64 / duration_ms as f64
        };
        let (overall, waste) = if success {
            (
                (resource_utilization + cost_efficiency + time_efficiency) / 3.0,
                1.0 - resource_utilization,
            )
        } else {
            (0.0, 1.0)
        };
        Self {
            timestamp: Utc::now(),
            resource_utilization,
            cost_efficiency,
            time_efficiency,
            overall,
            waste,
        }
    }
}

/// A suggested saving
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavingsOpportunity {
    /// Short action name
    pub action: String,
    /// What was observed
    pub description: String,
    /// Rough monthly saving in dollars
    pub estimated_monthly_savings: f64,
}

/// Cost summary; projections are heuristics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAnalysis {
    /// Sum of every recorded execution cost still in history
    pub total_cost: f64,
    /// Last samples, oldest first
    pub trend: Vec<f64>,
    /// Mean cost over the trend window
    pub average_cost: f64,
    /// Trend-window spend rate extrapolated to 30 days
    pub projected_monthly_cost: f64,
    /// Suggested actions
    pub opportunities: Vec<SavingsOpportunity>,
}

/// Extrapolate timestamped cost samples to a 30-day figure.
///
/// With at least two samples spread over time the observed spend rate is
/// scaled up; otherwise the window is assumed to represent one day.
pub fn project_monthly(samples: &[(DateTime<Utc>, f64)]) -> f64 {
    let sum: f64 = samples.iter().map(|(_, cost)| cost).sum();
    let span_ms = match (samples.first(), samples.last()) {
        (Some((first, _)), Some((last, _))) => (*last - *first).num_milliseconds() as f64,
        _ => 0.0,
    };

    if samples.len() >= 2 && span_ms > 0.0 {
        sum / span_ms * MS_PER_DAY * DAYS_PER_MONTH
    } else {
        sum * DAYS_PER_MONTH
    }
}

/// Savings suggestions from average efficiency and waste
pub fn savings_opportunities(
    avg_efficiency: Option<f64>,
    avg_waste: Option<f64>,
    projected_monthly: f64,
) -> Vec<SavingsOpportunity> {
    let mut opportunities = Vec::new();

    if let Some(efficiency) = avg_efficiency.filter(|e| *e < LOW_EFFICIENCY) {
        opportunities.push(SavingsOpportunity {
            action: "improve utilization".to_string(),
            description: format!(
                "Average efficiency {:.2} is below {:.2}",
                efficiency, LOW_EFFICIENCY
            ),
            estimated_monthly_savings: projected_monthly * (LOW_EFFICIENCY - efficiency),
        });
    }

    if let Some(waste) = avg_waste.filter(|w| *w > HIGH_WASTE) {
        opportunities.push(SavingsOpportunity {
            action: "reduce waste".to_string(),
            description: format!("Average waste {:.2} is above {:.2}", waste, HIGH_WASTE),
            estimated_monthly_savings: projected_monthly * waste,
        });
    }

    opportunities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_execution_is_all_waste() {
        let snapshot = EfficiencySnapshot::derive(0.8, 0.01, 0.05, 100, 1000, false);
        assert_eq!(snapshot.overall, 0.0);
        assert_eq!(snapshot.waste, 1.0);
    }

    #[test]
    fn test_efficient_execution() {
        let snapshot = EfficiencySnapshot::derive(1.0, 0.01, 0.05, 100, 1000, true);
        assert_eq!(snapshot.overall, 1.0);
        assert_eq!(snapshot.waste, 0.0);
    }

    #[test]
    fn test_projection_without_span_assumes_one_day() {
        let now = Utc::now();
        assert_eq!(project_monthly(&[(now, 2.0)]), 60.0);
        assert_eq!(project_monthly(&[]), 0.0);
    }

    #[test]
    fn test_projection_scales_observed_rate() {
        let start = Utc::now();
        let samples = [(start, 1.0), (start + chrono::Duration::days(1), 1.0)];
        assert!((project_monthly(&samples) - 60.0).abs() < 1e-9);
    }
}
