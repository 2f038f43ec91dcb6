//! Redis-backed broker.
//!
//! Each queue uses these keys under the configured prefix:
//!
//! - `{prefix}:{queue}:job:{id}`: job record as JSON
//! - `{prefix}:{queue}:wait`: sorted set of ready jobs scored by priority
//! - `{prefix}:{queue}:delayed`: sorted set of delayed jobs scored by ready time (ms)
//! - `{prefix}:{queue}:active`, `:completed`, `:failed`: job id sets
//! - `{prefix}:{queue}:finished`: list of finished job ids, newest first,
//!   trimmed to the retention bound along with the records it drops
//! - `{prefix}:{queue}:seq`: submission counter
//!
//! Members of the two sorted sets are `{sequence:020}:{id}`. Redis orders
//! equal scores lexicographically by member, so jobs of equal priority come
//! out in submission order.

use crate::broker::{Broker, BrokerUrl, Connector, JobCounts, DEFAULT_KEEP_FINISHED};
use crate::task::{Job, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

fn broker_err(e: redis::RedisError) -> crate::DispatchError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        crate::DispatchError::Connection(e.to_string())
    } else {
        crate::DispatchError::Broker(e.to_string())
    }
}

fn member(job: &Job) -> String {
    format!("{:020}:{}", job.sequence, job.id)
}

fn id_from_member(member: &str) -> &str {
    member.split_once(':').map_or(member, |(_, id)| id)
}

/// One Redis connection
pub struct RedisBroker {
    redis: ConnectionManager,
    prefix: String,
    keep_finished: usize,
    open: AtomicBool,
}

impl RedisBroker {
    /// Wrap an established connection manager
    pub fn from_connection(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            keep_finished: DEFAULT_KEEP_FINISHED,
            open: AtomicBool::new(true),
        }
    }

    /// Retain at most `keep` finished jobs per queue
    pub fn with_keep_finished(mut self, keep: usize) -> Self {
        self.keep_finished = keep;
        self
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn job_key(&self, queue: &str, job_id: &str) -> String {
        format!("{}:{}:job:{}", self.prefix, queue, job_id)
    }

    fn conn(&self) -> crate::Result<ConnectionManager> {
        if self.open.load(Ordering::SeqCst) {
            Ok(self.redis.clone())
        } else {
            Err(crate::DispatchError::Connection(
                "Broker connection is closed".to_string(),
            ))
        }
    }

    async fn load(&self, queue: &str, job_id: &str) -> crate::Result<Option<Job>> {
        let mut conn = self.conn()?;
        let data: Option<String> = conn
            .get(self.job_key(queue, job_id))
            .await
            .map_err(broker_err)?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, job: &Job) -> crate::Result<()> {
        let mut conn = self.conn()?;
        let data = serde_json::to_string(job)?;
        let _: () = conn
            .set(self.job_key(&job.queue, &job.id), data)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    /// Delete finished jobs beyond the retention bound
    async fn trim_finished(&self, queue: &str) -> crate::Result<()> {
        let mut conn = self.conn()?;
        let finished_key = self.key(queue, "finished");
        let keep = self.keep_finished as isize;

        let expired: Vec<String> = conn
            .lrange(&finished_key, keep, -1)
            .await
            .map_err(broker_err)?;
        if expired.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        if keep == 0 {
            pipe.del(&finished_key).ignore();
        } else {
            pipe.ltrim(&finished_key, 0, keep - 1).ignore();
        }
        for id in &expired {
            pipe.del(self.job_key(queue, id))
                .ignore()
                .srem(self.key(queue, "completed"), id)
                .ignore()
                .srem(self.key(queue, "failed"), id)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(broker_err)?;

        debug!("Evicted {} finished jobs from redis queue {}", expired.len(), queue);
        Ok(())
    }

    /// Move delayed jobs whose ready time has passed onto the wait set
    async fn promote_due(&self, queue: &str) -> crate::Result<()> {
        let mut conn = self.conn()?;
        let delayed_key = self.key(queue, "delayed");
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore(&delayed_key, "-inf", now_ms)
            .await
            .map_err(broker_err)?;

        for entry in due {
            // only the worker that wins the ZREM promotes the job
            let removed: i64 = conn.zrem(&delayed_key, &entry).await.map_err(broker_err)?;
            if removed == 0 {
                continue;
            }
            if let Some(mut job) = self.load(queue, id_from_member(&entry)).await? {
                job.status = JobStatus::Waiting;
                self.store(&job).await?;
                let _: () = conn
                    .zadd(
                        self.key(queue, "wait"),
                        &entry,
                        job.options.effective_priority() as f64,
                    )
                    .await
                    .map_err(broker_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn submit(&self, mut job: Job) -> crate::Result<Job> {
        let mut conn = self.conn()?;

        let sequence: u64 = conn
            .incr(self.key(&job.queue, "seq"), 1)
            .await
            .map_err(broker_err)?;
        job.sequence = sequence;

        let data = serde_json::to_string(&job)?;
        let (set_key, score) = if job.status == JobStatus::Delayed {
            (
                self.key(&job.queue, "delayed"),
                job.ready_at.timestamp_millis() as f64,
            )
        } else {
            (
                self.key(&job.queue, "wait"),
                job.options.effective_priority() as f64,
            )
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.job_key(&job.queue, &job.id), data)
            .ignore()
            .zadd(set_key, member(&job), score)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(broker_err)?;

        debug!(
            "Job {} submitted to redis queue {} (sequence: {})",
            job.id, job.queue, job.sequence
        );
        Ok(job)
    }

    async fn claim(&self, queue: &str) -> crate::Result<Option<Job>> {
        self.promote_due(queue).await?;
        let mut conn = self.conn()?;

        loop {
            let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                .arg(self.key(queue, "wait"))
                .arg(1)
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;

            let Some((entry, _)) = popped.into_iter().next() else {
                return Ok(None);
            };

            // removed jobs leave their entry behind; skip it
            let Some(mut job) = self.load(queue, id_from_member(&entry)).await? else {
                continue;
            };
            job.mark_active();
            self.store(&job).await?;
            let _: () = conn
                .sadd(self.key(queue, "active"), &job.id)
                .await
                .map_err(broker_err)?;
            return Ok(Some(job));
        }
    }

    async fn get(&self, queue: &str, job_id: &str) -> crate::Result<Option<Job>> {
        let job = self.load(queue, job_id).await?;
        Ok(job.map(|mut job| {
            if job.status == JobStatus::Delayed && job.is_ready() {
                job.status = JobStatus::Waiting;
            }
            job
        }))
    }

    async fn finish(&self, job: &Job) -> crate::Result<bool> {
        let mut conn = self.conn()?;
        let data = serde_json::to_string(job)?;
        let target = if job.status == JobStatus::Completed {
            "completed"
        } else {
            "failed"
        };

        // XX: a job removed while it ran stays removed
        let stored: Option<String> = redis::cmd("SET")
            .arg(self.job_key(&job.queue, &job.id))
            .arg(data)
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        if stored.is_none() {
            let _: () = conn
                .srem(self.key(&job.queue, "active"), &job.id)
                .await
                .map_err(broker_err)?;
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(self.key(&job.queue, "active"), &job.id)
            .ignore()
            .sadd(self.key(&job.queue, target), &job.id)
            .ignore()
            .lpush(self.key(&job.queue, "finished"), &job.id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(broker_err)?;

        self.trim_finished(&job.queue).await?;
        Ok(true)
    }

    async fn remove(&self, queue: &str, job_id: &str) -> crate::Result<bool> {
        let Some(job) = self.load(queue, job_id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn()?;
        let entry = member(&job);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.job_key(queue, job_id))
            .ignore()
            .zrem(self.key(queue, "wait"), &entry)
            .ignore()
            .zrem(self.key(queue, "delayed"), &entry)
            .ignore();
        for set in ["active", "completed", "failed"] {
            pipe.srem(self.key(queue, set), job_id).ignore();
        }
        pipe.lrem(self.key(queue, "finished"), 0, job_id).ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(broker_err)?;

        debug!("Job {} removed from redis queue {}", job_id, queue);
        Ok(true)
    }

    async fn counts(&self, queue: &str) -> crate::Result<JobCounts> {
        self.promote_due(queue).await?;
        let mut conn = self.conn()?;

        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(self.key(queue, "wait"))
                .zcard(self.key(queue, "delayed"))
                .scard(self.key(queue, "active"))
                .scard(self.key(queue, "completed"))
                .scard(self.key(queue, "failed"))
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn close(&self) -> crate::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Connector for `redis://` and `rediss://` URLs
pub struct RedisConnector {
    prefix: String,
    keep_finished: usize,
}

impl RedisConnector {
    /// Create a connector using the given key prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            keep_finished: DEFAULT_KEEP_FINISHED,
        }
    }

    /// Retain at most `keep` finished jobs per queue
    pub fn with_keep_finished(mut self, keep: usize) -> Self {
        self.keep_finished = keep;
        self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, url: &BrokerUrl) -> crate::Result<Arc<dyn Broker>> {
        let client = redis::Client::open(url.as_str())
            .map_err(|e| crate::DispatchError::Connection(e.to_string()))?;

        let mut redis = ConnectionManager::new(client)
            .await
            .map_err(|e| crate::DispatchError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut redis)
            .await
            .map_err(|e| crate::DispatchError::Connection(e.to_string()))?;

        info!("Connected to redis broker at {}", url);
        Ok(Arc::new(
            RedisBroker::from_connection(redis, self.prefix.clone())
                .with_keep_finished(self.keep_finished),
        ))
    }
}
