use std::{fmt::Display, sync::Arc, time::Duration};

use nanoid::nanoid;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{DurableExecution, Queue, error::QueueError};

/// Where a job re-enters the pending list after a delay or nack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequeuePosition {
    #[serde(rename = "first")]
    First,
    #[serde(rename = "last")]
    Last,
}

impl Display for RequeuePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequeuePosition::First => write!(f, "first"),
            RequeuePosition::Last => write!(f, "last"),
        }
    }
}

impl TryFrom<&str> for RequeuePosition {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "first" => Ok(RequeuePosition::First),
            "last" => Ok(RequeuePosition::Last),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayOptions {
    pub delay: Duration,
    pub position: RequeuePosition,
}

pub type JobResult<T, E> = Result<T, JobError<E>>;

/// Job-level failure disposition: nack re-enters the queue, fail is terminal.
pub enum JobError<E> {
    Nack {
        error: E,
        delay: Option<Duration>,
        position: RequeuePosition,
    },
    Fail(E),
}

pub trait ToJobResult<T, E> {
    fn map_err_nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobResult<T, E>;
    fn map_err_fail(self) -> JobResult<T, E>;
}

impl<T, E> ToJobResult<T, E> for Result<T, E> {
    fn map_err_nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobResult<T, E> {
        self.map_err(|e| JobError::Nack {
            error: e,
            delay,
            position,
        })
    }

    fn map_err_fail(self) -> JobResult<T, E> {
        self.map_err(JobError::Fail)
    }
}

pub trait ToJobError<E> {
    fn nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobError<E>;
    fn fail(self) -> JobError<E>;
}

impl<E> ToJobError<E> for E {
    fn nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobError<E> {
        JobError::Nack {
            error: self,
            delay,
            position,
        }
    }

    fn fail(self) -> JobError<E> {
        JobError::Fail(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobErrorType {
    #[serde(rename = "nack")]
    Nack {
        delay_ms: Option<u64>,
        position: RequeuePosition,
    },
    #[serde(rename = "fail")]
    Fail,
}

/// Persisted per-attempt error record, kept in a list next to the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorRecord<E> {
    pub error: E,
    pub attempt: u32,
    pub details: JobErrorType,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<T: Clone> {
    pub id: String,
    pub data: T,
    pub attempts: u32,
    pub created_at: u64,
    pub processed_at: Option<u64>,
    pub finished_at: Option<u64>,
}

/// A job currently held by a worker, together with the lease token proving
/// the hold. Completion operations consume the lease.
#[derive(Debug, Clone)]
pub struct BorrowedJob<T: Clone> {
    pub job: Job<T>,
    pub lease_token: String,
}

impl<T: Clone> BorrowedJob<T> {
    pub fn new(job: Job<T>, lease_token: String) -> Self {
        Self { job, lease_token }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Active,
    Delayed,
    Success,
    Failed,
}

pub struct JobOptions<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub data: T,
    pub id: String,
    pub delay: Option<DelayOptions>,
}

impl<T> JobOptions<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(data: T) -> Self {
        Self {
            data,
            id: nanoid!(),
            delay: None,
        }
    }

    /// Set a caller-chosen ID. Pushing the same ID twice is a no-op while the
    /// first job is still live (deduplication).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_delay(mut self, delay: DelayOptions) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub struct PushableJob<H: DurableExecution> {
    pub options: JobOptions<H::JobData>,
    pub queue: Arc<Queue<H>>,
}

impl<H: DurableExecution> PushableJob<H> {
    pub async fn push(self) -> Result<Job<H::JobData>, QueueError> {
        self.queue.push(self.options).await
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.options.id = id.into();
        self
    }

    pub fn with_delay(mut self, delay: DelayOptions) -> Self {
        self.options.delay = Some(delay);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_position_round_trips_through_str() {
        assert_eq!(
            RequeuePosition::try_from("first"),
            Ok(RequeuePosition::First)
        );
        assert_eq!(RequeuePosition::try_from("last"), Ok(RequeuePosition::Last));
        assert!(RequeuePosition::try_from("middle").is_err());
        assert_eq!(RequeuePosition::First.to_string(), "first");
        assert_eq!(RequeuePosition::Last.to_string(), "last");
    }

    #[test]
    fn job_options_generate_an_id_by_default() {
        let options = JobOptions::new("payload".to_string());
        assert!(!options.id.is_empty());

        let options = options.with_id("explicit");
        assert_eq!(options.id, "explicit");
        assert!(options.delay.is_none());
    }
}
