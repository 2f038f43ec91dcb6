/// Worker pool implementation
pub mod pool;

use crate::broker::Broker;
use crate::metrics::ResourceMetricsCollector;
use crate::task::executor::{JobExecutor, TaskHandler};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// What a pool's workers consume and how
#[derive(Clone)]
pub struct WorkerSpec {
    /// Queue to claim from
    pub queue: String,
    /// Code that performs the work
    pub handler: Arc<dyn TaskHandler>,
    /// Per-job timeout
    pub job_timeout_secs: u64,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Optional usage sink
    pub metrics: Option<Arc<ResourceMetricsCollector>>,
}

/// A worker that processes jobs from one queue
pub struct Worker {
    id: usize,
    queue: String,
    executor: JobExecutor,
    poll_interval: Duration,
    metrics: Option<Arc<ResourceMetricsCollector>>,
}

impl Worker {
    /// Create a worker from a pool spec
    pub fn new(id: usize, spec: &WorkerSpec) -> Self {
        Self {
            id,
            queue: spec.queue.clone(),
            executor: JobExecutor::new(Arc::clone(&spec.handler), spec.job_timeout_secs),
            poll_interval: spec.poll_interval,
            metrics: spec.metrics.clone(),
        }
    }

    /// Claim and run at most one job; returns whether a job was run
    pub async fn process_next(&self, broker: &dyn Broker) -> crate::Result<bool> {
        let Some(mut job) = broker.claim(&self.queue).await? else {
            return Ok(false);
        };
        debug!("Worker {} processing job {} from {}", self.id, job.id, self.queue);

        let outcome = self.executor.execute(&mut job).await;

        // the work happened whether or not the record survives
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(&outcome.usage, outcome.duration_ms, outcome.success);
        }

        if !broker.finish(&job).await? {
            debug!(
                "Job {} was removed from {} while running; result discarded",
                job.id, self.queue
            );
        }
        Ok(true)
    }

    /// Process jobs until the shutdown signal arrives; a job already
    /// claimed is always finished first
    pub async fn run_with_shutdown(
        &self,
        broker: Arc<dyn Broker>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("Worker {} started on {}", self.id, self.queue);

        loop {
            match shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            match self.process_next(broker.as_ref()).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) if e.is_connection() => {
                    warn!("Worker {} lost its broker connection: {}", self.id, e);
                }
                Err(e) => error!("Worker {} failed to process a job: {}", self.id, e),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!("Worker {} on {} stopped", self.id, self.queue);
    }
}
