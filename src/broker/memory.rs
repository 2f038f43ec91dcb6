//! In-process broker backing `memory://` URLs

use crate::broker::{Broker, BrokerUrl, Connector, JobCounts, DEFAULT_KEEP_FINISHED};
use crate::task::{Job, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Heap entry ordering jobs by priority, then submission order
#[derive(Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: u32,
    /// Sequence number for FIFO ordering within same priority
    sequence: u64,
    job_id: String,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: lower priority value and lower sequence must compare greater
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: Vec<String>,
    jobs: HashMap<String, Job>,
    /// Finished job ids, oldest first
    finished: VecDeque<String>,
    sequence: u64,
}

impl QueueState {
    /// Move delayed jobs whose time has come onto the ready heap
    fn promote_due(&mut self) {
        let now = Utc::now();
        let jobs = &mut self.jobs;
        let ready = &mut self.ready;
        self.delayed.retain(|id| match jobs.get_mut(id) {
            Some(job) if job.ready_at <= now => {
                job.status = JobStatus::Waiting;
                ready.push(ReadyEntry {
                    priority: job.options.effective_priority(),
                    sequence: job.sequence,
                    job_id: id.clone(),
                });
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    /// Drop the oldest finished jobs beyond `keep`
    fn evict_finished(&mut self, keep: usize) -> usize {
        let mut evicted = 0;
        while self.finished.len() > keep {
            if let Some(id) = self.finished.pop_front() {
                self.jobs.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Job storage shared by every connection a [`MemoryConnector`] opens
pub struct MemoryStore {
    queues: RwLock<HashMap<String, QueueState>>,
    keep_finished: usize,
}

impl MemoryStore {
    /// Empty store retaining at most `keep_finished` finished jobs per queue
    pub fn new(keep_finished: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            keep_finished,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_FINISHED)
    }
}

/// One connection to a [`MemoryStore`]
pub struct MemoryBroker {
    store: Arc<MemoryStore>,
    open: AtomicBool,
}

impl MemoryBroker {
    /// Open a broker over a fresh store
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::default()))
    }

    /// Open a broker over a fresh store with its own finished-job retention
    pub fn with_keep_finished(keep: usize) -> Self {
        Self::with_store(Arc::new(MemoryStore::new(keep)))
    }

    /// Open a broker over an existing store
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            open: AtomicBool::new(true),
        }
    }

    /// Simulate the connection dropping underneath its owner
    pub fn disconnect(&self) {
        self.open.store(false, AtomicOrdering::SeqCst);
    }

    fn ensure_open(&self) -> crate::Result<()> {
        if self.open.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(crate::DispatchError::Connection(
                "Broker connection is closed".to_string(),
            ))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn submit(&self, mut job: Job) -> crate::Result<Job> {
        self.ensure_open()?;

        let mut queues = self.store.queues.write().await;
        let state = queues.entry(job.queue.clone()).or_default();

        state.sequence += 1;
        job.sequence = state.sequence;

        if job.status == JobStatus::Delayed {
            state.delayed.push(job.id.clone());
        } else {
            state.ready.push(ReadyEntry {
                priority: job.options.effective_priority(),
                sequence: job.sequence,
                job_id: job.id.clone(),
            });
        }
        state.jobs.insert(job.id.clone(), job.clone());

        debug!(
            "Job {} submitted to {} with priority {:?} (sequence: {})",
            job.id, job.queue, job.options.priority, job.sequence
        );
        Ok(job)
    }

    async fn claim(&self, queue: &str) -> crate::Result<Option<Job>> {
        self.ensure_open()?;

        let mut queues = self.store.queues.write().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        state.promote_due();

        while let Some(entry) = state.ready.pop() {
            // entries of removed jobs are skipped lazily
            if let Some(job) = state.jobs.get_mut(&entry.job_id) {
                job.mark_active();
                debug!("Job {} claimed from {}", job.id, queue);
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn get(&self, queue: &str, job_id: &str) -> crate::Result<Option<Job>> {
        self.ensure_open()?;

        let mut queues = self.store.queues.write().await;
        Ok(queues.get_mut(queue).and_then(|state| {
            state.promote_due();
            state.jobs.get(job_id).cloned()
        }))
    }

    async fn finish(&self, job: &Job) -> crate::Result<bool> {
        self.ensure_open()?;

        let mut queues = self.store.queues.write().await;
        let Some(state) = queues.get_mut(&job.queue) else {
            return Ok(false);
        };
        let Some(stored) = state.jobs.get_mut(&job.id) else {
            return Ok(false);
        };

        let first_finish = !stored.status.is_finished();
        *stored = job.clone();
        if first_finish && job.status.is_finished() {
            state.finished.push_back(job.id.clone());
            let evicted = state.evict_finished(self.store.keep_finished);
            if evicted > 0 {
                debug!("Evicted {} finished jobs from {}", evicted, job.queue);
            }
        }
        Ok(true)
    }

    async fn remove(&self, queue: &str, job_id: &str) -> crate::Result<bool> {
        self.ensure_open()?;

        let mut queues = self.store.queues.write().await;
        let removed = queues
            .get_mut(queue)
            .map(|state| {
                state.delayed.retain(|id| id != job_id);
                state.finished.retain(|id| id != job_id);
                state.jobs.remove(job_id).is_some()
            })
            .unwrap_or(false);

        if removed {
            debug!("Job {} removed from {}", job_id, queue);
        }
        Ok(removed)
    }

    async fn counts(&self, queue: &str) -> crate::Result<JobCounts> {
        self.ensure_open()?;

        let mut queues = self.store.queues.write().await;
        let mut counts = JobCounts::default();
        if let Some(state) = queues.get_mut(queue) {
            state.promote_due();
            for job in state.jobs.values() {
                match job.status {
                    JobStatus::Waiting => counts.waiting += 1,
                    JobStatus::Delayed => counts.delayed += 1,
                    JobStatus::Active => counts.active += 1,
                    JobStatus::Completed => counts.completed += 1,
                    JobStatus::Failed => counts.failed += 1,
                }
            }
        }
        Ok(counts)
    }

    async fn close(&self) -> crate::Result<()> {
        self.open.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(AtomicOrdering::SeqCst)
    }
}

/// Connector for `memory://` URLs; all its connections share one store
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    connections: AtomicUsize,
    refuse: AtomicBool,
    connect_delay: Duration,
    last: Mutex<Option<Arc<MemoryBroker>>>,
}

impl MemoryConnector {
    /// Create a connector over a fresh store
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            connections: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            connect_delay: Duration::ZERO,
            last: Mutex::new(None),
        }
    }

    /// Retain at most `keep` finished jobs per queue; replaces the store,
    /// so call it before the first connection
    pub fn with_keep_finished(mut self, keep: usize) -> Self {
        self.store = Arc::new(MemoryStore::new(keep));
        self
    }

    /// Pause this long inside every connection attempt
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make subsequent connection attempts fail
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, AtomicOrdering::SeqCst);
    }

    /// Number of physical connections opened so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(AtomicOrdering::SeqCst)
    }

    /// Most recently opened connection
    pub fn last_connection(&self) -> Option<Arc<MemoryBroker>> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &BrokerUrl) -> crate::Result<Arc<dyn Broker>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.refuse.load(AtomicOrdering::SeqCst) {
            return Err(crate::DispatchError::Connection(format!(
                "Connection to {} refused",
                url
            )));
        }

        let broker = Arc::new(MemoryBroker::with_store(Arc::clone(&self.store)));
        let count = self.connections.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if let Ok(mut last) = self.last.lock() {
            *last = Some(Arc::clone(&broker));
        }

        info!("Opened in-memory broker connection #{} to {}", count, url);
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::EnqueueOptions;

    #[tokio::test]
    async fn test_removed_job_is_not_claimed() {
        let broker = MemoryBroker::new();
        let first = broker
            .submit(Job::new("run", serde_json::json!({"n": 1}), EnqueueOptions::default()))
            .await
            .unwrap();
        broker
            .submit(Job::new("run", serde_json::json!({"n": 2}), EnqueueOptions::default()))
            .await
            .unwrap();

        assert!(broker.remove("run", &first.id).await.unwrap());
        let claimed = broker.claim("run").await.unwrap().unwrap();
        assert_eq!(claimed.data["n"], 2);
        assert!(broker.claim("run").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_jobs_are_bounded() {
        let broker = MemoryBroker::with_keep_finished(3);
        let mut ids = Vec::new();
        for n in 0..5 {
            let job = broker
                .submit(Job::new("run", serde_json::json!({ "n": n }), EnqueueOptions::default()))
                .await
                .unwrap();
            ids.push(job.id);
            let mut claimed = broker.claim("run").await.unwrap().unwrap();
            claimed.mark_completed();
            assert!(broker.finish(&claimed).await.unwrap());
        }

        assert_eq!(broker.counts("run").await.unwrap().completed, 3);
        // oldest go first
        assert!(broker.get("run", &ids[0]).await.unwrap().is_none());
        assert!(broker.get("run", &ids[1]).await.unwrap().is_none());
        assert!(broker.get("run", &ids[4]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_finish_of_removed_job_stores_nothing() {
        let broker = MemoryBroker::new();
        broker
            .submit(Job::new("run", serde_json::json!({}), EnqueueOptions::default()))
            .await
            .unwrap();
        let mut claimed = broker.claim("run").await.unwrap().unwrap();
        assert!(broker.remove("run", &claimed.id).await.unwrap());

        claimed.mark_completed();
        assert!(!broker.finish(&claimed).await.unwrap());
        assert!(broker.get("run", &claimed.id).await.unwrap().is_none());
        assert_eq!(broker.counts("run").await.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_submit() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        let result = broker
            .submit(Job::new("run", serde_json::json!({}), EnqueueOptions::default()))
            .await;
        assert!(result.unwrap_err().is_connection());
    }
}
