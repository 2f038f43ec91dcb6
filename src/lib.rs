//! Dispatch Core - background task dispatch and execution telemetry
//!
//! This library provides broker-backed task queues with typed payloads,
//! a lifecycle-managed queue service with worker pools, a resource metrics
//! collector, a topic-based event bus and strategy performance tracking.

/// Message broker abstraction and implementations
pub mod broker;
/// Configuration management for the dispatch system
pub mod config;
/// Topic-based publish/subscribe event bus
pub mod events;
/// Resource metrics collection and analysis
pub mod metrics;
/// Typed queue channels and the queue service
pub mod queue;
/// Strategy execution metrics, events and learning
pub mod strategy;
/// Task envelopes, job records and execution logic
pub mod task;
/// Worker pool and worker management
pub mod worker;

pub use config::Config;
pub use events::EventBus;
pub use metrics::ResourceMetricsCollector;
pub use queue::service::QueueService;
pub use queue::QueueChannel;
pub use task::{EnqueueOptions, JobHandle, JobStatus, TaskCategory, TaskEnvelope};

use thiserror::Error;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error types for the dispatch system
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Broker unreachable, URL malformed or credentials rejected
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single submission was rejected after a connection was established
    #[error("Submission error: {0}")]
    Submission(String),

    /// The queue service has no live connection
    #[error("Queue service is not initialized")]
    NotInitialized,

    /// Broker operation other than submission failed
    #[error("Broker error: {0}")]
    Broker(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task execution failed with an error
    #[error("Task execution failed: {0}")]
    Execution(String),

    /// Worker pool encountered an error
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Event handler failed while processing an event
    #[error("Handler error: {0}")]
    Handler(String),

    /// Metric derivation or alert publication failed
    #[error("Metric recording error: {0}")]
    Metrics(String),

    /// Topic pattern could not be parsed
    #[error("Invalid topic pattern: {0}")]
    InvalidPattern(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Whether this error came from the broker connection itself
    pub fn is_connection(&self) -> bool {
        matches!(self, DispatchError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::NotInitialized;
        assert_eq!(err.to_string(), "Queue service is not initialized");

        let err = DispatchError::Connection("refused".to_string());
        assert_eq!(err.to_string(), "Connection error: refused");
        assert!(err.is_connection());
    }
}
