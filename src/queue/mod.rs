//! Typed queue channels

/// Queue service lifecycle
pub mod service;

use crate::broker::{Broker, JobCounts};
use crate::task::{EnqueueOptions, Job, JobHandle, JobStatus, TaskPayload};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Submission handle for one task category.
///
/// The payload type fixes the queue, so a `QueueChannel<EmailTask>` can only
/// ever submit email work.
pub struct QueueChannel<T> {
    broker: Arc<dyn Broker>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for QueueChannel<T> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            _payload: PhantomData,
        }
    }
}

impl<T: TaskPayload> QueueChannel<T> {
    /// Bind a channel to a broker connection
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            _payload: PhantomData,
        }
    }

    /// Queue name on the broker
    pub fn name(&self) -> &'static str {
        T::CATEGORY.queue_name()
    }

    /// Submit a payload; returns only once the broker has accepted it
    pub async fn add(&self, payload: T, options: EnqueueOptions) -> crate::Result<JobHandle<T>> {
        payload.validate()?;
        let data = serde_json::to_value(&payload)?;

        let job = self
            .broker
            .submit(Job::new(self.name(), data, options))
            .await
            .map_err(|e| {
                warn!("Submission to {} rejected: {}", self.name(), e);
                crate::DispatchError::Submission(e.to_string())
            })?;

        debug!("Job {} added to {}", job.id, job.queue);
        Ok(JobHandle {
            id: job.id,
            queue: job.queue,
            data: payload,
            options,
            submitted_at: job.created_at,
        })
    }

    /// Look up a job by id
    pub async fn get_job(&self, job_id: &str) -> crate::Result<Option<Job>> {
        self.broker.get(self.name(), job_id).await
    }

    /// Current status of a job, `None` when unknown
    pub async fn get_status(&self, job_id: &str) -> crate::Result<Option<JobStatus>> {
        Ok(self.get_job(job_id).await?.map(|job| job.status))
    }

    /// Delete a job; a claimed job keeps running but its record is gone
    pub async fn remove(&self, job_id: &str) -> crate::Result<bool> {
        self.broker.remove(self.name(), job_id).await
    }

    /// Job counts by status
    pub async fn counts(&self) -> crate::Result<JobCounts> {
        self.broker.counts(self.name()).await
    }
}
