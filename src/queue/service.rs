//! Queue service lifecycle
//!
//! The service owns at most one broker connection. Concurrent `init` calls
//! converge on a single shared connection attempt; `shutdown` waits for an
//! attempt in flight before tearing the connection down.

use crate::broker::memory::MemoryConnector;
use crate::broker::{Broker, BrokerUrl, Connector, DefaultConnector};
use crate::config::Config;
use crate::metrics::ResourceMetricsCollector;
use crate::queue::QueueChannel;
use crate::task::executor::TaskHandler;
use crate::task::{
    EmailTask, EnqueueOptions, JobHandle, JobStatus, RunTask, SwarmTask, TaskCategory,
    TaskEnvelope,
};
use crate::worker::pool::WorkerPool;
use crate::worker::WorkerSpec;
use crate::DispatchError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

type InitResult = std::result::Result<Arc<Connection>, Arc<DispatchError>>;
type InitAttempt = Shared<BoxFuture<'static, InitResult>>;

/// Observable lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No connection and no attempt in flight
    Uninitialized,
    /// A connection attempt is in flight
    Initializing,
    /// Connected; channels are available
    Ready,
    /// Connection closed by `shutdown`
    ShutDown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Initializing => "initializing",
            ServiceState::Ready => "ready",
            ServiceState::ShutDown => "shut_down",
        };
        f.write_str(s)
    }
}

/// One entry of a bulk status lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    /// Requested job id
    pub id: String,
    /// Broker status, `None` when the job is unknown
    pub status: Option<String>,
}

/// Worker settings applied to every category with a handler
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Workers per category
    pub worker_count: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Per-job timeout
    pub job_timeout_secs: u64,
    /// Upper bound for stopping worker pools
    pub shutdown_timeout: Duration,
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            job_timeout_secs: config.job_timeout_secs,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings::from(&Config::default())
    }
}

/// Live connection plus everything bound to it
struct Connection {
    url: BrokerUrl,
    broker: Arc<dyn Broker>,
    email: QueueChannel<EmailTask>,
    run: QueueChannel<RunTask>,
    swarm: QueueChannel<SwarmTask>,
    pools: tokio::sync::Mutex<Vec<WorkerPool>>,
}

impl Connection {
    async fn find_status(&self, job_id: &str) -> crate::Result<Option<JobStatus>> {
        for category in TaskCategory::ALL {
            if let Some(job) = self.broker.get(category.queue_name(), job_id).await? {
                return Ok(Some(job.status));
            }
        }
        Ok(None)
    }

    async fn close(&self, shutdown_timeout: Duration) {
        let mut pools = self.pools.lock().await;
        for pool in pools.iter_mut() {
            if let Err(e) = pool.shutdown(shutdown_timeout).await {
                warn!("Worker pool did not stop cleanly: {}", e);
            }
        }
        pools.clear();

        if let Err(e) = self.broker.close().await {
            warn!("Error closing broker connection to {}: {}", self.url, e);
        }
    }
}

enum Phase {
    Uninitialized,
    Initializing { generation: u64, attempt: InitAttempt },
    Ready(Arc<Connection>),
    ShutDown,
}

struct Inner {
    phase: Phase,
    generation: u64,
    last_url: Option<String>,
}

/// Everything a connection attempt needs, detached from the service
#[derive(Clone)]
struct Wiring {
    connector: Arc<dyn Connector>,
    settings: ServiceSettings,
    handlers: HashMap<TaskCategory, Arc<dyn TaskHandler>>,
    worker_counts: HashMap<TaskCategory, usize>,
    metrics: Option<Arc<ResourceMetricsCollector>>,
}

impl Wiring {
    fn workers_for(&self, category: TaskCategory) -> usize {
        self.worker_counts
            .get(&category)
            .copied()
            .unwrap_or(self.settings.worker_count)
    }

    async fn open(self, raw_url: String) -> InitResult {
        let url = BrokerUrl::parse(&raw_url).map_err(Arc::new)?;
        info!("Connecting queue service to {}", url);

        let broker = self.connector.connect(&url).await.map_err(|e| {
            error!("Queue service failed to connect to {}: {}", url, e);
            Arc::new(e)
        })?;

        let mut pools: Vec<WorkerPool> = Vec::new();
        for category in TaskCategory::ALL {
            let Some(handler) = self.handlers.get(&category) else {
                continue;
            };
            let mut pool = WorkerPool::new(self.workers_for(category));
            let started = pool.start(
                Arc::clone(&broker),
                WorkerSpec {
                    queue: category.queue_name().to_string(),
                    handler: Arc::clone(handler),
                    job_timeout_secs: self.settings.job_timeout_secs,
                    poll_interval: self.settings.poll_interval,
                    metrics: self.metrics.clone(),
                },
            );
            if let Err(e) = started {
                error!("Failed to start workers for {}: {}", category, e);
                for mut pool in pools {
                    let _ = pool.shutdown(self.settings.shutdown_timeout).await;
                }
                let _ = broker.close().await;
                return Err(Arc::new(e));
            }
            pools.push(pool);
        }

        info!(
            "Queue service ready on {} with {} worker pools",
            url,
            pools.len()
        );
        Ok(Arc::new(Connection {
            email: QueueChannel::new(Arc::clone(&broker)),
            run: QueueChannel::new(Arc::clone(&broker)),
            swarm: QueueChannel::new(Arc::clone(&broker)),
            url,
            broker,
            pools: tokio::sync::Mutex::new(pools),
        }))
    }
}

/// Rebuild an owned error from a shared attempt result
fn replay(err: &DispatchError) -> DispatchError {
    match err {
        DispatchError::Connection(msg) => DispatchError::Connection(msg.clone()),
        DispatchError::WorkerPool(msg) => DispatchError::WorkerPool(msg.clone()),
        other => DispatchError::Connection(other.to_string()),
    }
}

/// Builder for [`QueueService`]
pub struct QueueServiceBuilder {
    connector: Option<Arc<dyn Connector>>,
    settings: ServiceSettings,
    key_prefix: String,
    keep_finished: usize,
    handlers: HashMap<TaskCategory, Arc<dyn TaskHandler>>,
    worker_counts: HashMap<TaskCategory, usize>,
    metrics: Option<Arc<ResourceMetricsCollector>>,
}

impl QueueServiceBuilder {
    /// Take worker settings and key prefix from a config
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = ServiceSettings::from(config);
        self.key_prefix = config.key_prefix.clone();
        self.keep_finished = config.keep_finished;
        self
    }

    /// Override worker settings
    pub fn settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a specific connector instead of picking one by URL scheme
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Run workers for a category with this handler
    pub fn handler(mut self, category: TaskCategory, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(category, handler);
        self
    }

    /// Run `count` workers for a category instead of the shared worker count
    pub fn workers(mut self, category: TaskCategory, count: usize) -> Self {
        self.worker_counts.insert(category, count);
        self
    }

    /// Report execution usage to a collector
    pub fn metrics(mut self, metrics: Arc<ResourceMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Finish configuration; without an explicit connector the broker is
    /// picked from the URL scheme at `init`
    pub fn build(self) -> QueueService {
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(DefaultConnector::new(self.key_prefix).with_keep_finished(self.keep_finished))
        });
        QueueService {
            wiring: Wiring {
                connector,
                settings: self.settings,
                handlers: self.handlers,
                worker_counts: self.worker_counts,
                metrics: self.metrics,
            },
            inner: Mutex::new(Inner {
                phase: Phase::Uninitialized,
                generation: 0,
                last_url: None,
            }),
        }
    }
}

/// Owns the broker connection and hands out typed channels
pub struct QueueService {
    wiring: Wiring,
    inner: Mutex<Inner>,
}

impl QueueService {
    /// Create a service with no handlers over a connector
    pub fn new(connector: Arc<dyn Connector>, config: &Config) -> Self {
        Self::builder().config(config).connector(connector).build()
    }

    /// Start configuring a service
    pub fn builder() -> QueueServiceBuilder {
        QueueServiceBuilder {
            connector: None,
            settings: ServiceSettings::default(),
            key_prefix: Config::default().key_prefix,
            keep_finished: crate::broker::DEFAULT_KEEP_FINISHED,
            handlers: HashMap::new(),
            worker_counts: HashMap::new(),
            metrics: None,
        }
    }

    /// Fresh service over a fresh in-memory connector, for tests and local runs
    pub fn in_memory() -> (Self, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let service = Self::builder().connector(connector.clone()).build();
        (service, connector)
    }

    /// Connect to the broker at `url`.
    ///
    /// Returns immediately when already connected. Callers arriving while an
    /// attempt is in flight wait for that attempt and share its outcome.
    pub async fn init(&self, url: &str) -> crate::Result<()> {
        let (generation, attempt) = {
            let mut inner = self.inner.lock();
            let in_flight = match &inner.phase {
                Phase::Ready(connection) => {
                    if connection.url.as_str() != url {
                        warn!(
                            "Queue service already connected to {}, ignoring {}",
                            connection.url, url
                        );
                    }
                    return Ok(());
                }
                Phase::Initializing {
                    generation,
                    attempt,
                } => Some((*generation, attempt.clone())),
                Phase::Uninitialized | Phase::ShutDown => None,
            };

            match in_flight {
                Some(joined) => joined,
                None => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let attempt = self.wiring.clone().open(url.to_string()).boxed().shared();
                    inner.phase = Phase::Initializing {
                        generation,
                        attempt: attempt.clone(),
                    };
                    inner.last_url = Some(url.to_string());
                    (generation, attempt)
                }
            }
        };

        self.settle(generation, attempt)
            .await
            .map(|_| ())
            .map_err(|e| replay(&e))
    }

    /// Await an attempt and move the phase on if nobody else did
    async fn settle(&self, generation: u64, attempt: InitAttempt) -> InitResult {
        let result = attempt.await;

        let mut inner = self.inner.lock();
        if matches!(&inner.phase, Phase::Initializing { generation: g, .. } if *g == generation) {
            inner.phase = match &result {
                Ok(connection) => Phase::Ready(Arc::clone(connection)),
                Err(_) => Phase::Uninitialized,
            };
        }
        result
    }

    /// Stop workers and close the connection. Safe to call in any state.
    pub async fn shutdown(&self) {
        loop {
            let pending = {
                let mut inner = self.inner.lock();
                let in_flight = match &inner.phase {
                    Phase::Initializing {
                        generation,
                        attempt,
                    } => Some((*generation, attempt.clone())),
                    _ => None,
                };

                match in_flight {
                    Some(joined) => Err(joined),
                    None if matches!(inner.phase, Phase::Ready(_)) => {
                        match std::mem::replace(&mut inner.phase, Phase::ShutDown) {
                            Phase::Ready(connection) => Ok(Some(connection)),
                            _ => Ok(None),
                        }
                    }
                    None => Ok(None),
                }
            };

            match pending {
                Err((generation, attempt)) => {
                    let _ = self.settle(generation, attempt).await;
                }
                Ok(Some(connection)) => {
                    info!("Shutting down queue service on {}", connection.url);
                    connection.close(self.wiring.settings.shutdown_timeout).await;
                    info!("Queue service shut down");
                    return;
                }
                Ok(None) => return,
            }
        }
    }

    /// Shut down and reconnect to the last URL passed to `init`
    pub async fn reset(&self) -> crate::Result<()> {
        let url = self
            .inner
            .lock()
            .last_url
            .clone()
            .ok_or(DispatchError::NotInitialized)?;
        info!("Resetting queue service");
        self.shutdown().await;
        self.init(&url).await
    }

    fn connection(&self) -> crate::Result<Arc<Connection>> {
        match &self.inner.lock().phase {
            Phase::Ready(connection) => Ok(Arc::clone(connection)),
            _ => Err(DispatchError::NotInitialized),
        }
    }

    /// Email channel
    pub fn email(&self) -> crate::Result<QueueChannel<EmailTask>> {
        Ok(self.connection()?.email.clone())
    }

    /// Run channel
    pub fn run(&self) -> crate::Result<QueueChannel<RunTask>> {
        Ok(self.connection()?.run.clone())
    }

    /// Swarm channel
    pub fn swarm(&self) -> crate::Result<QueueChannel<SwarmTask>> {
        Ok(self.connection()?.swarm.clone())
    }

    /// Route an envelope to the channel of its category
    pub async fn enqueue(
        &self,
        envelope: TaskEnvelope,
        options: EnqueueOptions,
    ) -> crate::Result<JobHandle<TaskEnvelope>> {
        let connection = self.connection()?;
        let handle = match envelope {
            TaskEnvelope::Email(task) => connection
                .email
                .add(task, options)
                .await?
                .map(TaskEnvelope::Email),
            TaskEnvelope::Run(task) => connection.run.add(task, options).await?.map(TaskEnvelope::Run),
            TaskEnvelope::Swarm(task) => connection
                .swarm
                .add(task, options)
                .await?
                .map(TaskEnvelope::Swarm),
        };
        Ok(handle)
    }

    /// Bulk status lookup across every channel.
    ///
    /// `user_id` is reserved for ownership checks and not enforced yet.
    pub async fn get_task_statuses<S: AsRef<str>>(
        &self,
        _user_id: &str,
        ids: &[S],
    ) -> crate::Result<Vec<TaskStatusEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let connection = self.connection()?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            let status = connection.find_status(id).await?;
            entries.push(TaskStatusEntry {
                id: id.to_string(),
                status: status.map(|s| s.as_str().to_string()),
            });
        }
        Ok(entries)
    }

    /// Current lifecycle phase
    pub fn state(&self) -> ServiceState {
        match self.inner.lock().phase {
            Phase::Uninitialized => ServiceState::Uninitialized,
            Phase::Initializing { .. } => ServiceState::Initializing,
            Phase::Ready(_) => ServiceState::Ready,
            Phase::ShutDown => ServiceState::ShutDown,
        }
    }

    /// Whether channels are available
    pub fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// URL of the live connection, credentials masked
    pub fn connection_url(&self) -> Option<String> {
        self.connection().ok().map(|c| c.url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channels_unavailable_before_init() {
        let (service, _) = QueueService::in_memory();
        assert_eq!(service.state(), ServiceState::Uninitialized);
        assert!(matches!(service.email(), Err(DispatchError::NotInitialized)));
        assert!(matches!(service.reset().await, Err(DispatchError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_malformed_url_leaves_service_retryable() {
        let (service, connector) = QueueService::in_memory();
        let err = service.init("ftp://nowhere").await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(service.state(), ServiceState::Uninitialized);
        assert_eq!(connector.connection_count(), 0);

        service.init("memory://local").await.unwrap();
        assert!(service.is_ready());
        assert_eq!(service.connection_url().as_deref(), Some("memory://local"));
    }

    struct NoopHandler;

    #[async_trait::async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _job: &crate::task::Job) -> crate::Result<crate::metrics::ExecutionUsage> {
            Ok(crate::metrics::ExecutionUsage::default())
        }
    }

    #[tokio::test]
    async fn test_worker_count_per_category() {
        let service = QueueService::builder()
            .connector(Arc::new(MemoryConnector::new()))
            .settings(ServiceSettings {
                worker_count: 1,
                poll_interval: Duration::from_millis(10),
                job_timeout_secs: 5,
                shutdown_timeout: Duration::from_secs(2),
            })
            .handler(TaskCategory::Email, Arc::new(NoopHandler))
            .handler(TaskCategory::Swarm, Arc::new(NoopHandler))
            .workers(TaskCategory::Swarm, 4)
            .build();
        service.init("memory://local").await.unwrap();

        let connection = service.connection().unwrap();
        let mut sizes: Vec<(String, usize)> = connection
            .pools
            .lock()
            .await
            .iter()
            .map(|pool| (pool.queue().unwrap_or_default().to_string(), pool.worker_count()))
            .collect();
        sizes.sort();
        assert_eq!(
            sizes,
            vec![("email".to_string(), 1), ("swarm".to_string(), 4)]
        );

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_status_lookup_needs_no_connection() {
        let (service, _) = QueueService::in_memory();
        let ids: [&str; 0] = [];
        assert!(service.get_task_statuses("user", &ids).await.unwrap().is_empty());
    }
}
