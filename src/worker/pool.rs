use crate::broker::Broker;
use crate::worker::{Worker, WorkerSpec};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// A pool of workers draining one queue concurrently
pub struct WorkerPool {
    worker_count: usize,
    queue: Option<String>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl WorkerPool {
    /// Create a new worker pool with the specified number of workers
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            queue: None,
            handles: Vec::new(),
            shutdown_tx: None,
        }
    }

    /// Spawn the workers; a pool that is already running is left as is
    pub fn start(&mut self, broker: Arc<dyn Broker>, spec: WorkerSpec) -> crate::Result<()> {
        if self.is_running() {
            return Err(crate::DispatchError::WorkerPool(format!(
                "Pool for {} is already running",
                spec.queue
            )));
        }
        if self.worker_count == 0 {
            return Err(crate::DispatchError::WorkerPool(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        info!(
            "Starting worker pool with {} workers on {}",
            self.worker_count, spec.queue
        );

        for i in 0..self.worker_count {
            let worker = Worker::new(i, &spec);
            let broker = Arc::clone(&broker);
            let shutdown_rx = shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                worker.run_with_shutdown(broker, shutdown_rx).await;
            });

            self.handles.push(handle);
        }
        self.queue = Some(spec.queue);

        Ok(())
    }

    /// Signal every worker and wait for them, bounded by `timeout_duration`
    pub async fn shutdown(&mut self, timeout_duration: Duration) -> crate::Result<()> {
        let queue = self.queue.take().unwrap_or_default();
        info!("Stopping worker pool on {}", queue);

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let shutdown_result = timeout(timeout_duration, async {
            for (idx, handle) in handles.into_iter().enumerate() {
                if let Err(e) = handle.await {
                    warn!("Worker {} on {} panicked: {}", idx, queue, e);
                }
            }
        })
        .await;

        match shutdown_result {
            Ok(()) => {
                info!("All workers on {} stopped", queue);
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Shutdown timeout exceeded on {}, aborting remaining workers",
                    queue
                );
                for abort in aborts {
                    abort.abort();
                }
                Err(crate::DispatchError::WorkerPool(
                    "Shutdown timeout exceeded".to_string(),
                ))
            }
        }
    }

    /// Get the number of workers in the pool
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue the pool drains, once started
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Check if the pool is running
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }
}
