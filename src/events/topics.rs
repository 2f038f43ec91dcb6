//! Canonical event topics.
//!
//! Hierarchical, slash separated. Subscribers use `*` for one segment.

// Strategy execution
pub const TOPIC_STRATEGY_SUCCESS: &str = "strategy/performance/success";
pub const TOPIC_STRATEGY_FAILURE: &str = "strategy/performance/failure";
pub const PATTERN_STRATEGY_PERFORMANCE: &str = "strategy/performance/*";
pub const TOPIC_STRATEGY_THRESHOLD_PREFIX: &str = "strategy/threshold";
pub const PATTERN_STRATEGY_THRESHOLD: &str = "strategy/threshold/*";

// Resource health
pub const TOPIC_RESOURCE_ALERT_PREFIX: &str = "resource/alert";
pub const PATTERN_RESOURCE_ALERT: &str = "resource/alert/*";

// Learning agents
pub const TOPIC_SUGGESTION_URGENT: &str = "optimization/suggestion/urgent";
pub const TOPIC_SUGGESTION_ROUTINE: &str = "optimization/suggestion/routine";
pub const PATTERN_SUGGESTION: &str = "optimization/suggestion/*";

/// Join a prefix and a final segment
pub fn child(prefix: &str, segment: &str) -> String {
    format!("{}/{}", prefix, segment)
}
