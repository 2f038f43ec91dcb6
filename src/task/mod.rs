/// Task handler and job executor
pub mod executor;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Closed set of task categories, one queue channel each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Outgoing email
    Email,
    /// Routine run execution
    Run,
    /// Swarm / conversation execution
    Swarm,
}

impl TaskCategory {
    /// All categories, in channel registration order
    pub const ALL: [TaskCategory; 3] = [TaskCategory::Email, TaskCategory::Run, TaskCategory::Swarm];

    /// Name of the broker queue backing this category
    pub fn queue_name(&self) -> &'static str {
        match self {
            TaskCategory::Email => "email",
            TaskCategory::Run => "run",
            TaskCategory::Swarm => "swarm",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// A payload type bound to exactly one task category
pub trait TaskPayload:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Category whose channel accepts this payload
    const CATEGORY: TaskCategory;

    /// Reject payloads that could never be executed
    fn validate(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Email delivery task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTask {
    /// Recipient addresses
    pub to: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub text: String,
    /// Optional HTML body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

impl EmailTask {
    /// Create a plain text email
    pub fn new(to: Vec<String>, subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to,
            subject: subject.into(),
            text: text.into(),
            html: None,
        }
    }
}

impl TaskPayload for EmailTask {
    const CATEGORY: TaskCategory = TaskCategory::Email;

    fn validate(&self) -> crate::Result<()> {
        if self.to.is_empty() {
            return Err(crate::DispatchError::Submission(
                "Email task requires at least one recipient".to_string(),
            ));
        }
        Ok(())
    }
}

/// Routine run task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTask {
    /// Run being executed
    pub run_id: String,
    /// Owner of the run
    pub user_id: String,
    /// Whether the run was started under a premium plan
    #[serde(default)]
    pub is_premium: bool,
    /// Free-form run configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

impl RunTask {
    /// Create a run task
    pub fn new(run_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: user_id.into(),
            is_premium: false,
            config: None,
        }
    }
}

impl TaskPayload for RunTask {
    const CATEGORY: TaskCategory = TaskCategory::Run;

    fn validate(&self) -> crate::Result<()> {
        if self.run_id.is_empty() || self.user_id.is_empty() {
            return Err(crate::DispatchError::Submission(
                "Run task requires runId and userId".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a swarm task is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SwarmExecutionType {
    /// Full multi-agent swarm
    #[default]
    Swarm,
    /// Single routine within a conversation
    Routine,
    /// Single step
    Step,
}

/// Swarm execution task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmTask {
    /// Conversation the swarm runs in
    pub conversation_id: String,
    /// Requesting user
    pub user_id: String,
    /// Model used by the swarm
    pub model: String,
    /// Execution flavour
    #[serde(default)]
    pub execution_type: SwarmExecutionType,
    /// Free-form swarm configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

impl SwarmTask {
    /// Create a swarm task
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            model: model.into(),
            execution_type: SwarmExecutionType::default(),
            config: None,
        }
    }
}

impl TaskPayload for SwarmTask {
    const CATEGORY: TaskCategory = TaskCategory::Swarm;

    fn validate(&self) -> crate::Result<()> {
        if self.conversation_id.is_empty() || self.model.is_empty() {
            return Err(crate::DispatchError::Submission(
                "Swarm task requires conversationId and model".to_string(),
            ));
        }
        Ok(())
    }
}

/// One unit of deferred work, tagged by `taskType`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "taskType")]
pub enum TaskEnvelope {
    /// Email delivery
    Email(EmailTask),
    /// Routine run
    Run(RunTask),
    /// Swarm execution
    Swarm(SwarmTask),
}

impl TaskEnvelope {
    /// Category derived from the variant
    pub fn category(&self) -> TaskCategory {
        match self {
            TaskEnvelope::Email(_) => TaskCategory::Email,
            TaskEnvelope::Run(_) => TaskCategory::Run,
            TaskEnvelope::Swarm(_) => TaskCategory::Swarm,
        }
    }
}

impl From<EmailTask> for TaskEnvelope {
    fn from(task: EmailTask) -> Self {
        TaskEnvelope::Email(task)
    }
}

impl From<RunTask> for TaskEnvelope {
    fn from(task: RunTask) -> Self {
        TaskEnvelope::Run(task)
    }
}

impl From<SwarmTask> for TaskEnvelope {
    fn from(task: SwarmTask) -> Self {
        TaskEnvelope::Swarm(task)
    }
}

/// Scheduling hints passed along with a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnqueueOptions {
    /// Time before the job becomes eligible to run
    #[serde(default, with = "duration_ms")]
    pub delay: Option<Duration>,
    /// Lower value runs first
    #[serde(default)]
    pub priority: Option<u32>,
}

impl EnqueueOptions {
    /// Options with a delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Options with a priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Priority used for ordering; jobs without one run after all prioritised jobs
    pub fn effective_priority(&self) -> u32 {
        self.priority.unwrap_or(u32::MAX)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Status of a job in the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible and waiting for a worker
    Waiting,
    /// Submitted with a delay that has not elapsed yet
    Delayed,
    /// Claimed by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    /// Broker status string
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the job has reached a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-side record of a submitted job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier
    pub id: String,

    /// Queue the job was submitted to
    pub queue: String,

    /// Serialized task payload
    pub data: Value,

    /// Scheduling options applied at submission
    pub options: EnqueueOptions,

    /// Current status
    pub status: JobStatus,

    /// Submission order within the queue, assigned by the broker
    pub sequence: u64,

    /// Number of times a worker picked this job up
    pub attempts: u32,

    /// Submission timestamp
    pub created_at: DateTime<Utc>,

    /// Earliest time the job may run
    pub ready_at: DateTime<Utc>,

    /// Last time a worker claimed the job
    pub started_at: Option<DateTime<Utc>>,

    /// Completion or failure time
    pub finished_at: Option<DateTime<Utc>>,

    /// Error message if the job failed
    pub error: Option<String>,
}

impl Job {
    /// Create a new job for the given queue
    pub fn new(queue: impl Into<String>, data: Value, options: EnqueueOptions) -> Self {
        let now = Utc::now();
        let (status, ready_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (
                JobStatus::Delayed,
                now + chrono::Duration::milliseconds(delay.as_millis() as i64),
            ),
            _ => (JobStatus::Waiting, now),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            data,
            options,
            status,
            sequence: 0,
            attempts: 0,
            created_at: now,
            ready_at,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Whether the job's delay has elapsed
    pub fn is_ready(&self) -> bool {
        Utc::now() >= self.ready_at
    }

    /// Mark job as claimed by a worker
    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
    }

    /// Mark job as completed
    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.error = None;
    }

    /// Mark job as failed
    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Decode the payload as a specific task type
    pub fn payload<T: TaskPayload>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Wall-clock run time, if the job has started and finished
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Returned from a successful submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle<T> {
    /// Broker job id
    pub id: String,
    /// Queue the job was submitted to
    pub queue: String,
    /// Echo of the submitted payload
    pub data: T,
    /// Options applied at submission
    pub options: EnqueueOptions,
    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
}

impl<T> JobHandle<T> {
    /// Re-wrap the echoed payload
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> JobHandle<U> {
        JobHandle {
            id: self.id,
            queue: self.queue,
            data: f(self.data),
            options: self.options,
            submitted_at: self.submitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_tagged_by_task_type() {
        let envelope = TaskEnvelope::from(EmailTask::new(vec!["a@b.com".into()], "S", "T"));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["taskType"], "Email");
        assert_eq!(value["subject"], "S");
        assert_eq!(envelope.category(), TaskCategory::Email);

        let back: TaskEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_delayed_job_not_ready() {
        let job = Job::new(
            "email",
            serde_json::json!({}),
            EnqueueOptions::default().with_delay(Duration::from_secs(60)),
        );
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_ready());
    }

    #[test]
    fn test_missing_priority_sorts_last() {
        let opts = EnqueueOptions::default();
        assert_eq!(opts.effective_priority(), u32::MAX);
        assert_eq!(opts.with_priority(1).effective_priority(), 1);
    }
}
