//! Executor

use crate::metrics::ExecutionUsage;
use crate::task::Job;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Trait for the code that actually performs a category's work
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the job and report the resources it consumed
    async fn handle(&self, job: &Job) -> crate::Result<ExecutionUsage>;
}

/// Result of running one job
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Resources reported by the handler, default when it failed
    pub usage: ExecutionUsage,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Whether the handler succeeded within the timeout
    pub success: bool,
}

/// Runs handlers with a timeout and drives job status transitions
pub struct JobExecutor {
    handler: Arc<dyn TaskHandler>,
    timeout_duration: Duration,
}

impl JobExecutor {
    /// Create a new executor around a handler
    pub fn new(handler: Arc<dyn TaskHandler>, timeout_secs: u64) -> Self {
        Self {
            handler,
            timeout_duration: Duration::from_secs(timeout_secs),
        }
    }

    /// Execute a claimed job; the job is left completed or failed
    pub async fn execute(&self, job: &mut Job) -> ExecutionOutcome {
        if job.started_at.is_none() {
            job.mark_active();
        }
        let started = std::time::Instant::now();

        let result = timeout(self.timeout_duration, self.handler.handle(job)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(usage)) => {
                job.mark_completed();
                info!("Job {} on {} completed in {}ms", job.id, job.queue, duration_ms);
                ExecutionOutcome {
                    usage,
                    duration_ms,
                    success: true,
                }
            }
            Ok(Err(e)) => {
                let error_msg = format!("Job execution error: {e}");
                error!("{error_msg}");
                job.mark_failed(error_msg);
                ExecutionOutcome {
                    usage: ExecutionUsage::default(),
                    duration_ms,
                    success: false,
                }
            }
            Err(_) => {
                let error_msg = format!("Job {} timed out", job.id);
                warn!("{error_msg}");
                job.mark_failed(error_msg);
                ExecutionOutcome {
                    usage: ExecutionUsage::default(),
                    duration_ms,
                    success: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EnqueueOptions, JobStatus};

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(&self, _job: &Job) -> crate::Result<ExecutionUsage> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ExecutionUsage::default())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _job: &Job) -> crate::Result<ExecutionUsage> {
            Err(crate::DispatchError::Execution("smtp refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_timeout_marks_job_failed() {
        let executor = JobExecutor::new(Arc::new(SlowHandler), 1);
        let mut job = Job::new("email", serde_json::json!({}), EnqueueOptions::default());

        let outcome = executor.execute(&mut job).await;
        assert!(!outcome.success);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_handler_error_marks_job_failed() {
        let executor = JobExecutor::new(Arc::new(FailingHandler), 5);
        let mut job = Job::new("email", serde_json::json!({}), EnqueueOptions::default());

        let outcome = executor.execute(&mut job).await;
        assert!(!outcome.success);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }
}
